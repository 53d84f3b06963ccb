//! src/pool.rs
//!
//! Worker pool for fanning a pipeline out over K workers.
//!
//! # Key features
//! - Fixed-size worker collection allocated once, indexed by worker id
//! - One private channel pair per worker, never shared
//! - Reset before every pass, including the first
//! - Graceful, idempotent shutdown on `finalize()` and on drop
//!
//! # Lifecycle
//! ```text
//!   spawn ──▶ initialize_iteration ──▶ iter ──▶ initialize_iteration ──▶ ... ──▶ finalize
//!              (ResetIteration ×K)     (merge)                                   (Terminate ×K)
//! ```
//!
//! Handshakes are issued to all workers first and acknowledged afterwards,
//! so K workers reset or terminate concurrently.

use tracing::{debug, info, warn};

use crate::common::thread::WorkerInfo;
use crate::config::MultiProcessingConfig;
use crate::error::{ReadingServiceError, Result};
use crate::merge::MergedStream;
use crate::pipeline::DataPipe;
use crate::worker::WorkerHandle;

/// Owns K workers and their channel pairs.
pub struct WorkerPool<T> {
    workers: Vec<WorkerHandle<T>>,
    config: MultiProcessingConfig,
    finalized: bool,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `config.num_workers` workers, each running shard `i` of `pipe`.
    ///
    /// If any spawn fails, the workers already started are terminated and
    /// joined before the error is returned.
    pub fn spawn<P>(pipe: &P, config: &MultiProcessingConfig) -> Result<Self>
    where
        P: DataPipe<Item = T>,
    {
        config.validate()?;
        let num_workers = config.num_workers;
        if num_workers == 0 {
            return Err(ReadingServiceError::InvalidConfig(
                "Cannot create WorkerPool with 0 workers. \
                Either set num_workers > 0 or iterate in-process."
                    .into(),
            ));
        }

        let mut pool = Self::from_handles(Vec::with_capacity(num_workers), config.clone());
        for id in 0..num_workers {
            let info = WorkerInfo { id, num_workers };
            match WorkerHandle::spawn(info, pipe.clone(), config) {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    if let Err(cleanup) = pool.finalize() {
                        warn!("Cleanup after failed spawn also failed: {}", cleanup);
                    }
                    return Err(e);
                }
            }
        }

        info!(num_workers, "Started worker pool");
        Ok(pool)
    }
}

impl<T> WorkerPool<T> {
    pub(crate) fn from_handles(
        workers: Vec<WorkerHandle<T>>,
        config: MultiProcessingConfig,
    ) -> Self {
        Self {
            workers,
            config,
            finalized: false,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn ensure_running(&self) -> Result<()> {
        if self.finalized {
            return Err(ReadingServiceError::Precondition(
                "worker pool has been finalized".into(),
            ));
        }
        Ok(())
    }

    /// Sends `ResetIteration` to every worker and waits for every `ResetAck`.
    ///
    /// Must run before every pass over the merged stream, including the first.
    pub fn initialize_iteration(&mut self) -> Result<()> {
        self.ensure_running()?;
        let timeout = self.config.terminate_timeout;
        self.handshake(|w| w.begin_reset(), |w| w.finish_reset(timeout))?;
        debug!(num_workers = self.workers.len(), "Reset all workers");
        Ok(())
    }

    /// Applies `seed` to every worker's pipeline. Takes effect at the next reset.
    pub fn reseed(&mut self, seed: u64) -> Result<()> {
        self.ensure_running()?;
        let timeout = self.config.terminate_timeout;
        self.handshake(|w| w.begin_reseed(seed), |w| w.finish_reseed(timeout))
    }

    // Issues a request to every worker, then collects the answer from every
    // worker the request reached, so no acknowledgement is left queued.
    fn handshake<B, F>(&mut self, mut begin: B, mut finish: F) -> Result<()>
    where
        B: FnMut(&mut WorkerHandle<T>) -> Result<()>,
        F: FnMut(&mut WorkerHandle<T>) -> Result<()>,
    {
        let mut first_error = None;
        let mut reached = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            match begin(worker) {
                Ok(()) => reached.push(true),
                Err(e) => {
                    first_error.get_or_insert(e);
                    reached.push(false);
                }
            }
        }
        for (worker, reached) in self.workers.iter_mut().zip(reached) {
            if reached {
                if let Err(e) = finish(worker) {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the merged stream for the current pass.
    pub fn iter(&mut self) -> Result<MergedStream<'_, T>> {
        self.ensure_running()?;
        Ok(MergedStream::new(
            &mut self.workers,
            self.config.poll_interval,
            self.config.poll_mode,
        ))
    }

    /// Terminates and joins every worker. Idempotent.
    ///
    /// Every worker is cleaned up even when some of them fail; the first
    /// failure is returned.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let mut first_error = None;
        for worker in &mut self.workers {
            if let Err(e) = worker.begin_terminate() {
                warn!(worker = worker.id(), "Terminate failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        for worker in &mut self.workers {
            if let Err(e) = worker.finish_terminate(self.config.terminate_timeout) {
                warn!(worker = worker.id(), "Terminate handshake failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        info!(num_workers = self.workers.len(), "Worker pool finalized");
        self.workers.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("Failed to finalize worker pool on drop: {}", e);
        }
    }
}
