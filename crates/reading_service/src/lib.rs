//! Reading services for iterable data pipelines.
//!
//! A pipeline (`DataPipe`) is executed by a `ReadingService`:
//! - in the caller's thread (`InProcessReadingService`),
//! - fanned out over K worker threads and merged round-robin
//!   (`MultiProcessingReadingService`),
//! - or sharded across the ranks of a distributed job, with a shared seed per
//!   pass and an end-of-pass barrier (`DistributedReadingService`).
//!
//! `DataLoader` drives a service through its lifecycle.

pub mod common;
pub mod config;
pub mod distributed;
pub mod error;
pub mod loader;
pub mod merge;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod reading_service;
pub(crate) mod worker;

pub use common::thread::{current_worker, WorkerInfo};
pub use config::{
    CollectiveBackend, DistributedConfig, MultiProcessingConfig, PollMode, StartMethod,
    WorkerInitFn,
};
pub use distributed::{
    CollectiveRuntime, DistributedReadingService, FullSync, HostRuntime, ProcessGroup,
};
pub use error::{Component, ReadingServiceError, Result};
pub use loader::DataLoader;
pub use merge::MergedStream;
pub use pipeline::{DataPipe, DataSource, IterableWrapper, SourcePipe};
pub use pool::WorkerPool;
pub use protocol::{Request, Response};
pub use reading_service::{
    InProcessReadingService, LocalStream, MultiProcessingReadingService, ReadingService,
};
