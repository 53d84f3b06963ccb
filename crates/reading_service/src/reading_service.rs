//! src/reading_service.rs
//!
//! Reading services: how a pipeline is executed for a data loader.
//!
//! # Lifecycle
//! ```text
//!   initialize(pipe) ──▶ initialize_iteration ──▶ iter ──▶ finalize_iteration ──▶ ... ──▶ finalize
//! ```
//!
//! - `InProcessReadingService`: runs the pipeline in the caller's thread.
//! - `MultiProcessingReadingService`: fans the pipeline out over a worker
//!   pool and merges the workers round-robin. With `num_workers == 0` it
//!   behaves like the in-process service.
//! - `DistributedReadingService` (in `distributed`): shards by rank, shares
//!   one seed per pass, and synchronizes the end of every pass.

use tracing::{debug, info};

use crate::config::MultiProcessingConfig;
use crate::error::{Component, ReadingServiceError, Result};
use crate::merge::MergedStream;
use crate::pipeline::DataPipe;
use crate::pool::WorkerPool;

/// Executes a pipeline on behalf of a data loader.
pub trait ReadingService<P: DataPipe> {
    /// Item stream of one pass.
    type Stream<'a>: Iterator<Item = Result<P::Item>>
    where
        Self: 'a;

    /// Takes ownership of the pipeline and prepares execution resources.
    fn initialize(&mut self, pipe: P) -> Result<()>;

    /// Prepares a new pass. Called before every pass, including the first.
    fn initialize_iteration(&mut self) -> Result<()> {
        Ok(())
    }

    fn iter(&mut self) -> Result<Self::Stream<'_>>;

    /// Releases per-pass resources once a pass is over.
    fn finalize_iteration(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases everything. Safe to call more than once.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

fn not_initialized() -> ReadingServiceError {
    ReadingServiceError::Precondition("reading service has not been initialized".into())
}

/// A pipeline pass run in the caller's thread.
///
/// Item errors are attributed to the local pipeline and end the pass.
pub struct LocalStream<I> {
    inner: I,
    fused: bool,
}

impl<I> LocalStream<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            fused: false,
        }
    }
}

impl<I, T> Iterator for LocalStream<I>
where
    I: Iterator<Item = anyhow::Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.inner.next() {
            Some(Ok(item)) => Some(Ok(item)),
            Some(Err(source)) => {
                self.fused = true;
                Some(Err(ReadingServiceError::Pipeline {
                    component: Component::Local,
                    source,
                }))
            }
            None => {
                self.fused = true;
                None
            }
        }
    }
}

/// Runs the pipeline in the caller's thread.
pub struct InProcessReadingService<P> {
    pipe: Option<P>,
}

impl<P> InProcessReadingService<P> {
    pub fn new() -> Self {
        Self { pipe: None }
    }
}

impl<P> Default for InProcessReadingService<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DataPipe> ReadingService<P> for InProcessReadingService<P> {
    type Stream<'a> = LocalStream<P::Iter>;

    fn initialize(&mut self, pipe: P) -> Result<()> {
        self.pipe = Some(pipe);
        Ok(())
    }

    fn iter(&mut self) -> Result<Self::Stream<'_>> {
        let pipe = self.pipe.as_ref().ok_or_else(not_initialized)?;
        Ok(LocalStream::new(pipe.iter()))
    }

    fn finalize(&mut self) -> Result<()> {
        self.pipe = None;
        Ok(())
    }
}

/// Stream of one `MultiProcessingReadingService` pass.
pub enum MultiProcessingStream<'a, P: DataPipe> {
    InProcess(LocalStream<P::Iter>),
    Merged(MergedStream<'a, P::Item>),
}

impl<P: DataPipe> Iterator for MultiProcessingStream<'_, P> {
    type Item = Result<P::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            MultiProcessingStream::InProcess(stream) => stream.next(),
            MultiProcessingStream::Merged(stream) => stream.next(),
        }
    }
}

/// Fans a pipeline out over `num_workers` workers.
///
/// Worker `i` runs shard `i` of the pipeline; the shards are merged
/// round-robin. Persistent workers live until `finalize`; otherwise a fresh
/// pool is spawned for every pass and torn down in `finalize_iteration`.
pub struct MultiProcessingReadingService<P: DataPipe> {
    config: MultiProcessingConfig,
    pipe: Option<P>,
    pool: Option<WorkerPool<P::Item>>,
    pending_seed: Option<u64>,
}

impl<P: DataPipe> MultiProcessingReadingService<P> {
    pub fn new(config: MultiProcessingConfig) -> Self {
        Self {
            config,
            pipe: None,
            pool: None,
            pending_seed: None,
        }
    }

    pub fn config(&self) -> &MultiProcessingConfig {
        &self.config
    }

    /// Number of live workers. Zero between passes of a non-persistent
    /// service and after `finalize`.
    pub fn live_workers(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.num_workers())
    }

    /// Seeds the pipeline for the next pass.
    ///
    /// The seed is applied to the controller's copy right away and reaches
    /// live workers at the next `initialize_iteration`.
    pub fn apply_seed(&mut self, seed: u64) {
        if let Some(pipe) = self.pipe.as_mut() {
            pipe.apply_seed(seed);
        }
        self.pending_seed = Some(seed);
    }

    fn spawn_pool(&mut self) -> Result<()> {
        let pipe = self.pipe.as_ref().ok_or_else(not_initialized)?;
        self.pool = Some(WorkerPool::spawn(pipe, &self.config)?);
        Ok(())
    }
}

impl<P: DataPipe> ReadingService<P> for MultiProcessingReadingService<P> {
    type Stream<'a> = MultiProcessingStream<'a, P>;

    fn initialize(&mut self, mut pipe: P) -> Result<()> {
        self.config.validate()?;
        if let Some(seed) = self.pending_seed {
            pipe.apply_seed(seed);
        }
        self.pipe = Some(pipe);
        if self.config.num_workers > 0 {
            self.spawn_pool()?;
        }
        info!(
            num_workers = self.config.num_workers,
            persistent = self.config.persistent_workers,
            "Initialized multiprocessing reading service"
        );
        Ok(())
    }

    fn initialize_iteration(&mut self) -> Result<()> {
        if self.pipe.is_none() {
            return Err(not_initialized());
        }
        if self.config.num_workers == 0 {
            self.pending_seed = None;
            return Ok(());
        }
        if self.pool.is_none() {
            self.spawn_pool()?;
        }
        let seed = self.pending_seed.take();
        let pool = self.pool.as_mut().ok_or_else(not_initialized)?;
        if let Some(seed) = seed {
            pool.reseed(seed)?;
        }
        pool.initialize_iteration()
    }

    fn iter(&mut self) -> Result<Self::Stream<'_>> {
        if self.config.num_workers == 0 {
            let pipe = self.pipe.as_ref().ok_or_else(not_initialized)?;
            return Ok(MultiProcessingStream::InProcess(LocalStream::new(pipe.iter())));
        }
        let pool = self.pool.as_mut().ok_or_else(not_initialized)?;
        Ok(MultiProcessingStream::Merged(pool.iter()?))
    }

    fn finalize_iteration(&mut self) -> Result<()> {
        if self.config.persistent_workers {
            return Ok(());
        }
        if let Some(mut pool) = self.pool.take() {
            debug!("Tearing down non-persistent workers");
            pool.finalize()?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.pipe = None;
        self.pending_seed = None;
        if let Some(mut pool) = self.pool.take() {
            pool.finalize()?;
        }
        Ok(())
    }
}
