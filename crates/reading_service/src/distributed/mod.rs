//! Distributed coordination across ranks.
//!
//! - `runtime`: the collective runtime boundary (`CollectiveRuntime`, `ProcessGroup`)
//! - `host`: a backend whose ranks are threads of one host
//! - `full_sync`: end-of-pass barrier adaptor
//! - `service`: `DistributedReadingService`

pub mod full_sync;
pub mod host;
pub mod runtime;
pub mod service;

pub use full_sync::FullSync;
pub use host::HostRuntime;
pub use runtime::{CollectiveRuntime, ProcessGroup};
pub use service::{DistributedReadingService, RankContext};
