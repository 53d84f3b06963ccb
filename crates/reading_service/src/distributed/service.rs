//! Distributed reading service.
//!
//! Every rank runs one instance with its own runtime handle. On
//! `initialize` the pipeline is sharded by `(world_size, rank)`, so ranks
//! read disjoint data; with local workers each rank's shard is split again
//! by worker. Each pass starts with rank 0 broadcasting a fresh seed and ends
//! with a barrier across ranks.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::full_sync::FullSync;
use super::runtime::{CollectiveRuntime, ProcessGroup};
use crate::config::{DistributedConfig, MultiProcessingConfig};
use crate::error::{ReadingServiceError, Result};
use crate::pipeline::DataPipe;
use crate::reading_service::{
    MultiProcessingReadingService, MultiProcessingStream, ReadingService,
};

/// Identity and group of this rank, valid between `initialize` and `finalize`.
#[derive(Clone)]
pub struct RankContext {
    pub rank: usize,
    pub world_size: usize,
    pub group: Arc<dyn ProcessGroup>,
    /// Deadline of every collective on `group`.
    pub timeout: Duration,
}

/// Draws a seed on rank 0 and returns it on every rank.
pub(crate) fn share_seed(group: &dyn ProcessGroup) -> Result<u64> {
    let local = (group.rank() == 0).then(|| rand::rng().random::<u64>());
    group.broadcast_u64(local, 0)
}

/// Shards a pipeline across ranks and keeps passes in lockstep.
pub struct DistributedReadingService<P: DataPipe> {
    runtime: Arc<dyn CollectiveRuntime>,
    config: DistributedConfig,
    context: Option<RankContext>,
    local: MultiProcessingReadingService<P>,
    full_sync: bool,
    last_seed: Option<u64>,
}

impl<P: DataPipe> DistributedReadingService<P> {
    /// Fails with `Precondition` when no collective runtime is available.
    pub fn new(
        runtime: Option<Arc<dyn CollectiveRuntime>>,
        config: DistributedConfig,
    ) -> Result<Self> {
        let runtime = runtime.ok_or_else(|| {
            ReadingServiceError::Precondition("no collective runtime is available".into())
        })?;
        config.validate()?;
        Ok(Self {
            runtime,
            config,
            context: None,
            local: MultiProcessingReadingService::new(MultiProcessingConfig::default()),
            full_sync: true,
            last_seed: None,
        })
    }

    /// Runs each rank's shard over a local worker pool.
    pub fn with_local_workers(mut self, config: MultiProcessingConfig) -> Self {
        self.local = MultiProcessingReadingService::new(config);
        self
    }

    pub fn context(&self) -> Option<&RankContext> {
        self.context.as_ref()
    }

    /// Seed shared by all ranks for the current pass.
    pub fn last_seed(&self) -> Option<u64> {
        self.last_seed
    }

    fn require_context(&self) -> Result<&RankContext> {
        self.context.as_ref().ok_or_else(|| {
            ReadingServiceError::Precondition(
                "distributed reading service is not initialized".into(),
            )
        })
    }
}

impl<P: DataPipe> ReadingService<P> for DistributedReadingService<P> {
    type Stream<'a> = FullSync<MultiProcessingStream<'a, P>>;

    fn initialize(&mut self, mut pipe: P) -> Result<()> {
        if !self.runtime.is_started() {
            return Err(ReadingServiceError::Precondition(
                "collective runtime has not been started".into(),
            ));
        }

        let rank = self.runtime.rank();
        let world_size = self.runtime.world_size();
        let group = self.runtime.new_group(self.config.backend, self.config.timeout)?;

        pipe.apply_sharding(world_size, rank);
        self.full_sync = !pipe.is_full_sync();
        self.local.initialize(pipe)?;
        self.context = Some(RankContext {
            rank,
            world_size,
            group,
            timeout: self.config.timeout,
        });

        info!(
            rank,
            world_size,
            timeout = ?self.config.timeout,
            "Initialized distributed reading service"
        );
        Ok(())
    }

    fn initialize_iteration(&mut self) -> Result<()> {
        let context = self.require_context()?;
        let rank = context.rank;
        let seed = share_seed(context.group.as_ref())?;
        debug!(rank, seed, "Shared pass seed");

        self.last_seed = Some(seed);
        self.local.apply_seed(seed);
        self.local.initialize_iteration()
    }

    fn iter(&mut self) -> Result<Self::Stream<'_>> {
        let group = self.require_context()?.group.clone();
        let full_sync = self.full_sync;
        let inner = self.local.iter()?;
        if full_sync {
            Ok(FullSync::new(inner, group))
        } else {
            Ok(FullSync::passthrough(inner))
        }
    }

    fn finalize_iteration(&mut self) -> Result<()> {
        self.local.finalize_iteration()
    }

    fn finalize(&mut self) -> Result<()> {
        self.context = None;
        self.local.finalize()
    }
}
