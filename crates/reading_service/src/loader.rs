//! src/loader.rs
//!
//! `DataLoader` drives a reading service through its lifecycle.
//!
//! # Example
//! ```ignore
//! let pipe = IterableWrapper::new(items).shuffle();
//! let config = MultiProcessingConfig::builder()
//!     .num_workers(4)
//!     .persistent_workers(true)
//!     .build();
//! let mut loader = DataLoader::new(pipe, MultiProcessingReadingService::new(config));
//!
//! for epoch in 0..3 {
//!     for item in loader.iter()? {
//!         let item = item?;
//!         // ...
//!     }
//! }
//! loader.shutdown()?;
//! ```
//!
//! The service is initialized lazily on the first `iter()`. Each later
//! `iter()` closes the previous pass (`finalize_iteration`) before starting
//! the next one (`initialize_iteration`).

use tracing::{debug, warn};

use crate::error::{ReadingServiceError, Result};
use crate::pipeline::DataPipe;
use crate::reading_service::ReadingService;

pub struct DataLoader<P: DataPipe, R: ReadingService<P>> {
    pipe: Option<P>,
    service: R,
    epoch: usize,
    in_pass: bool,
    shut_down: bool,
}

impl<P: DataPipe, R: ReadingService<P>> DataLoader<P, R> {
    pub fn new(pipe: P, service: R) -> Self {
        Self {
            pipe: Some(pipe),
            service,
            epoch: 0,
            in_pass: false,
            shut_down: false,
        }
    }

    /// Number of passes started so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn service(&self) -> &R {
        &self.service
    }

    /// Starts a new pass and returns its item stream.
    pub fn iter(&mut self) -> Result<R::Stream<'_>> {
        if self.shut_down {
            return Err(ReadingServiceError::Precondition(
                "data loader has been shut down".into(),
            ));
        }
        if let Some(pipe) = self.pipe.take() {
            self.service.initialize(pipe)?;
        }
        if self.in_pass {
            self.in_pass = false;
            self.service.finalize_iteration()?;
        }

        self.service.initialize_iteration()?;
        self.in_pass = true;
        self.epoch += 1;
        debug!(epoch = self.epoch, "Starting pass");
        self.service.iter()
    }

    /// Finalizes the reading service. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        if self.pipe.is_some() {
            // Never initialized: nothing to release.
            return Ok(());
        }
        if self.in_pass {
            self.in_pass = false;
            if let Err(e) = self.service.finalize_iteration() {
                warn!("Failed to finalize last pass: {}", e);
            }
        }
        self.service.finalize()
    }
}

impl<P: DataPipe, R: ReadingService<P>> Drop for DataLoader<P, R> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to shut down data loader on drop: {}", e);
        }
    }
}
