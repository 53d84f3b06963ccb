//! src/error.rs
//!
//! Error taxonomy for reading services.
//!
//! Every fatal condition names the component that failed (worker index or
//! rank) so a caller can tell which part of the fan-out broke. None of these
//! errors are retried internally.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The part of the system an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// The controller-side pipeline running in the caller's thread.
    Local,
    /// A pool worker, by index.
    Worker(usize),
    /// A distributed rank.
    Rank(usize),
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Local => write!(f, "local pipeline"),
            Component::Worker(id) => write!(f, "worker {}", id),
            Component::Rank(rank) => write!(f, "rank {}", rank),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReadingServiceError {
    /// A worker answered out of sequence or without an outstanding request.
    #[error("Protocol violation from worker {worker}: {detail}")]
    ProtocolViolation { worker: usize, detail: String },

    /// A worker exited or stopped answering.
    #[error("Worker {worker} crashed: {reason}")]
    WorkerCrash { worker: usize, reason: String },

    /// A handshake or collective exceeded its deadline.
    #[error("Timeout on {component} after {waited:?}")]
    Timeout {
        component: Component,
        waited: Duration,
    },

    /// An operation was invoked before its runtime was available.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The user pipeline returned an error.
    #[error("Pipeline error on {component}")]
    Pipeline {
        component: Component,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to spawn worker {worker}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ReadingServiceError {
    pub(crate) fn crash(worker: usize, reason: impl Into<String>) -> Self {
        ReadingServiceError::WorkerCrash {
            worker,
            reason: reason.into(),
        }
    }

    pub(crate) fn violation(worker: usize, detail: impl Into<String>) -> Self {
        ReadingServiceError::ProtocolViolation {
            worker,
            detail: detail.into(),
        }
    }

    /// True for errors that abort the pass because a collective deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReadingServiceError::Timeout { .. })
    }

    /// The component the error is attributed to, when there is one.
    pub fn component(&self) -> Option<Component> {
        match self {
            ReadingServiceError::ProtocolViolation { worker, .. }
            | ReadingServiceError::WorkerCrash { worker, .. }
            | ReadingServiceError::Spawn { worker, .. } => Some(Component::Worker(*worker)),
            ReadingServiceError::Timeout { component, .. }
            | ReadingServiceError::Pipeline { component, .. } => Some(*component),
            ReadingServiceError::Precondition(_) | ReadingServiceError::InvalidConfig(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReadingServiceError>;
