//! Collective runtime boundary.
//!
//! The coordinator never reaches for ambient global state: it is handed a
//! `CollectiveRuntime` handle and asks it for a `ProcessGroup`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::CollectiveBackend;
use crate::error::Result;

/// Membership handle for one rank of a distributed job.
pub trait CollectiveRuntime: Send + Sync {
    /// True once the caller has started the runtime.
    fn is_started(&self) -> bool;

    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Forms a new group over all ranks. Every rank must call this the same
    /// number of times, in the same order.
    fn new_group(&self, backend: CollectiveBackend, timeout: Duration)
        -> Result<Arc<dyn ProcessGroup>>;
}

/// Collective operations over a fixed set of ranks.
///
/// Every operation is bounded by the group's timeout; expiry is reported as
/// `ReadingServiceError::Timeout` naming this rank.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Returns the value held by `src` on every rank. `value` must be `Some`
    /// on `src` and is ignored elsewhere.
    fn broadcast_u64(&self, value: Option<u64>, src: usize) -> Result<u64>;

    /// Blocks until every rank has entered the same barrier round.
    fn barrier(&self) -> Result<()>;

    /// Non-blocking check that the barrier round this rank will enter next
    /// has not already expired on ranks that are waiting in it.
    fn check_barrier(&self) -> Result<()>;
}
