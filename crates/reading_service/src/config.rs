//! src/config.rs
//!
//! Configuration for reading services.
//!
//! Example:
//! ```ignore
//! let config = MultiProcessingConfig::builder()
//!     .num_workers(4)
//!     .persistent_workers(true)
//!     .response_timeout(Duration::from_secs(10))
//!     .build();
//!
//! let dist = DistributedConfig::builder()
//!     .timeout(Duration::from_secs(600))
//!     .build();
//! ```
//!
//! # Tuning notes:
//! - `poll_interval`: how long the merge loop waits when every worker is busy.
//!                    Shorter is more responsive, longer burns less CPU.
//! - `response_timeout`: bounded wait for an outstanding item before the
//!                       worker is declared crashed.
//! - `persistent_workers`: keeps workers alive across passes instead of
//!                         respawning them every pass.

use anyhow::Result as AnyResult;
use std::sync::Arc;
use std::time::Duration;

use crate::common::thread::WorkerInfo;
use crate::error::{ReadingServiceError, Result};

/// Default deadline for distributed collectives: 30 minutes.
pub const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Hook run inside every worker after its identity is known and before its
/// pipeline is sharded.
pub type WorkerInitFn = Arc<dyn Fn(WorkerInfo) -> AnyResult<()> + Send + Sync>;

/// How workers are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMethod {
    /// Named OS thread with the platform default stack.
    #[default]
    Thread,
    /// Named OS thread with an explicit stack size in bytes.
    ThreadWithStack(usize),
}

/// How the merge loop waits when every active worker answered `Busy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollMode {
    /// Sleep `poll_interval` unconditionally.
    #[default]
    Backoff,
    /// Block until any active worker has a response ready, at most `poll_interval`.
    Readiness,
}

/// Configuration for `MultiProcessingReadingService` and `WorkerPool`.
#[derive(Clone)]
pub struct MultiProcessingConfig {
    /// Number of workers (0 = iterate in the caller's thread)
    pub num_workers: usize,
    /// Whether to keep workers alive across passes
    pub persistent_workers: bool,
    pub start_method: StartMethod,
    /// Optional per-worker initialization hook
    pub worker_init_fn: Option<WorkerInitFn>,
    /// Maximum time an outstanding `NextItem` may stay unanswered. Default: 30s
    pub response_timeout: Duration,
    /// Maximum time to wait for `ResetAck` / `TerminateAck`. Default: 30s
    pub terminate_timeout: Duration,
    /// Wait between scans when every worker is busy. Default: 1ms
    pub poll_interval: Duration,
    pub poll_mode: PollMode,
}

impl Default for MultiProcessingConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            persistent_workers: false,
            start_method: StartMethod::Thread,
            worker_init_fn: None,
            response_timeout: Duration::from_secs(30),
            terminate_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1),
            poll_mode: PollMode::Backoff,
        }
    }
}

impl MultiProcessingConfig {
    pub fn builder() -> MultiProcessingConfigBuilder {
        MultiProcessingConfigBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.response_timeout.is_zero() {
            return Err(ReadingServiceError::InvalidConfig(
                "response_timeout must be greater than zero".into(),
            ));
        }
        if self.terminate_timeout.is_zero() {
            return Err(ReadingServiceError::InvalidConfig(
                "terminate_timeout must be greater than zero".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ReadingServiceError::InvalidConfig(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if let StartMethod::ThreadWithStack(0) = self.start_method {
            return Err(ReadingServiceError::InvalidConfig(
                "worker stack size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for MultiProcessingConfig with method chaining
#[derive(Default)]
pub struct MultiProcessingConfigBuilder {
    config: MultiProcessingConfig,
}

impl MultiProcessingConfigBuilder {
    /// Set the number of workers
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    /// Enable persistent workers that survive across passes.
    pub fn persistent_workers(mut self, persistent: bool) -> Self {
        self.config.persistent_workers = persistent;
        self
    }

    pub fn start_method(mut self, method: StartMethod) -> Self {
        self.config.start_method = method;
        self
    }

    /// Run `hook` inside every worker before it shards its pipeline.
    /// An error from the hook is reported as a crash of that worker.
    pub fn worker_init_fn<F>(mut self, hook: F) -> Self
    where
        F: Fn(WorkerInfo) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.config.worker_init_fn = Some(Arc::new(hook));
        self
    }

    /// Set the bounded wait for an outstanding item.
    ///
    /// - Too low: slow pipelines are mistaken for crashed workers.
    /// - Too high: delays detection of stuck workers.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.config.terminate_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn poll_mode(mut self, mode: PollMode) -> Self {
        self.config.poll_mode = mode;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> MultiProcessingConfig {
        self.config
    }
}

/// Collective backend used by the distributed coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectiveBackend {
    /// Portable CPU backend; the only one this layer supports.
    #[default]
    Host,
}

/// Configuration for `DistributedReadingService`.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Deadline for seed broadcast and end-of-epoch barrier. Default: 30 min
    pub timeout: Duration,
    pub backend: CollectiveBackend,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COLLECTIVE_TIMEOUT,
            backend: CollectiveBackend::Host,
        }
    }
}

impl DistributedConfig {
    pub fn builder() -> DistributedConfigBuilder {
        DistributedConfigBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(ReadingServiceError::InvalidConfig(
                "distributed timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct DistributedConfigBuilder {
    config: DistributedConfig,
}

impl DistributedConfigBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn backend(mut self, backend: CollectiveBackend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn build(self) -> DistributedConfig {
        self.config
    }
}
