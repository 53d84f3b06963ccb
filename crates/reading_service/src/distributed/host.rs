//! Host collective backend.
//!
//! Ranks are threads of one host. Each rank holds its own `HostRuntime`
//! handle; the handles of one world share a rendezvous table per group.
//!
//! ```ignore
//! let ranks = HostRuntime::world(2);
//! for runtime in ranks {
//!     std::thread::spawn(move || {
//!         runtime.start();
//!         let runtime: Arc<dyn CollectiveRuntime> = Arc::new(runtime);
//!         // build a DistributedReadingService with Some(runtime)
//!     });
//! }
//! ```
//!
//! Collective calls are matched by round: the n-th broadcast on one rank
//! pairs with the n-th broadcast on every other rank, same for barriers.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::runtime::{CollectiveRuntime, ProcessGroup};
use crate::config::CollectiveBackend;
use crate::error::{Component, ReadingServiceError, Result};

struct BroadcastSlot {
    value: u64,
    readers_left: usize,
}

struct BarrierRound {
    arrived: usize,
    departed: usize,
    opened_at: Instant,
    released: bool,
}

#[derive(Default)]
struct GroupState {
    broadcasts: HashMap<u64, BroadcastSlot>,
    /// Readers that gave up on a round before its source posted it.
    abandoned_broadcasts: HashMap<u64, usize>,
    barriers: HashMap<u64, BarrierRound>,
    /// First barrier round that expired. It and every later round fail.
    expired_from: Option<u64>,
}

impl GroupState {
    fn barrier_expired(&self, round: u64) -> bool {
        self.expired_from.is_some_and(|first| round >= first)
    }

    fn expire_barrier(&mut self, round: u64) {
        self.barriers.remove(&round);
        self.expired_from = Some(self.expired_from.map_or(round, |first| first.min(round)));
    }
}

#[derive(Default)]
struct GroupShared {
    state: Mutex<GroupState>,
    changed: Condvar,
}

struct HostWorld {
    world_size: usize,
    groups: Mutex<Vec<Arc<GroupShared>>>,
}

/// One rank's handle to a host-local world.
pub struct HostRuntime {
    rank: usize,
    world: Arc<HostWorld>,
    started: AtomicBool,
    groups_formed: AtomicUsize,
}

impl HostRuntime {
    /// Creates the handles of a world of `world_size` ranks, indexed by rank.
    pub fn world(world_size: usize) -> Vec<HostRuntime> {
        let world = Arc::new(HostWorld {
            world_size,
            groups: Mutex::new(Vec::new()),
        });
        (0..world_size)
            .map(|rank| HostRuntime {
                rank,
                world: world.clone(),
                started: AtomicBool::new(false),
                groups_formed: AtomicUsize::new(0),
            })
            .collect()
    }

    /// Marks this rank's runtime as started.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }
}

impl CollectiveRuntime for HostRuntime {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world.world_size
    }

    fn new_group(
        &self,
        backend: CollectiveBackend,
        timeout: Duration,
    ) -> Result<Arc<dyn ProcessGroup>> {
        if !self.is_started() {
            return Err(ReadingServiceError::Precondition(format!(
                "host runtime of rank {} is not started",
                self.rank
            )));
        }
        match backend {
            CollectiveBackend::Host => {}
        }

        let index = self.groups_formed.fetch_add(1, Ordering::SeqCst);
        let shared = {
            let mut groups = self.world.groups.lock();
            while groups.len() <= index {
                groups.push(Arc::new(GroupShared::default()));
            }
            groups[index].clone()
        };

        debug!(rank = self.rank, group = index, "Formed host process group");
        Ok(Arc::new(HostGroup {
            rank: self.rank,
            world_size: self.world.world_size,
            timeout,
            shared,
            broadcast_round: AtomicU64::new(0),
            barrier_round: AtomicU64::new(0),
        }))
    }
}

struct HostGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    shared: Arc<GroupShared>,
    broadcast_round: AtomicU64,
    barrier_round: AtomicU64,
}

impl HostGroup {
    fn timed_out(&self) -> ReadingServiceError {
        ReadingServiceError::Timeout {
            component: Component::Rank(self.rank),
            waited: self.timeout,
        }
    }
}

impl ProcessGroup for HostGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast_u64(&self, value: Option<u64>, src: usize) -> Result<u64> {
        if src >= self.world_size {
            return Err(ReadingServiceError::InvalidConfig(format!(
                "broadcast source {} outside world of {}",
                src, self.world_size
            )));
        }
        let round = self.broadcast_round.fetch_add(1, Ordering::SeqCst);

        if self.rank == src {
            let value = value.ok_or_else(|| {
                ReadingServiceError::Precondition(format!(
                    "broadcast source rank {} supplied no value",
                    src
                ))
            })?;
            if self.world_size > 1 {
                let mut state = self.shared.state.lock();
                let abandoned = state.abandoned_broadcasts.remove(&round).unwrap_or(0);
                let readers_left = (self.world_size - 1).saturating_sub(abandoned);
                if readers_left > 0 {
                    state.broadcasts.insert(
                        round,
                        BroadcastSlot {
                            value,
                            readers_left,
                        },
                    );
                    self.shared.changed.notify_all();
                }
            }
            return Ok(value);
        }

        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(slot) = state.broadcasts.get_mut(&round) {
                let value = slot.value;
                slot.readers_left -= 1;
                if slot.readers_left == 0 {
                    state.broadcasts.remove(&round);
                }
                return Ok(value);
            }
            if Instant::now() >= deadline {
                *state.abandoned_broadcasts.entry(round).or_insert(0) += 1;
                return Err(self.timed_out());
            }
            self.shared.changed.wait_until(&mut state, deadline);
        }
    }

    fn barrier(&self) -> Result<()> {
        let round = self.barrier_round.fetch_add(1, Ordering::SeqCst);
        let world_size = self.world_size;

        let mut state = self.shared.state.lock();
        if state.barrier_expired(round) {
            return Err(self.timed_out());
        }
        let entry = state.barriers.entry(round).or_insert_with(|| BarrierRound {
            arrived: 0,
            departed: 0,
            opened_at: Instant::now(),
            released: false,
        });
        let deadline = entry.opened_at + self.timeout;
        if Instant::now() >= deadline {
            // Peers gave up before this rank arrived.
            state.expire_barrier(round);
            self.shared.changed.notify_all();
            return Err(self.timed_out());
        }
        entry.arrived += 1;
        if entry.arrived == world_size {
            entry.released = true;
            self.shared.changed.notify_all();
        }

        loop {
            if let Some(entry) = state.barriers.get_mut(&round) {
                if entry.released {
                    entry.departed += 1;
                    if entry.departed == world_size {
                        state.barriers.remove(&round);
                    }
                    debug!(rank = self.rank, round, "Barrier released");
                    return Ok(());
                }
            }
            if state.barrier_expired(round) {
                return Err(self.timed_out());
            }
            if Instant::now() >= deadline {
                debug!(rank = self.rank, round, "Barrier expired");
                state.expire_barrier(round);
                self.shared.changed.notify_all();
                return Err(self.timed_out());
            }
            self.shared.changed.wait_until(&mut state, deadline);
        }
    }

    fn check_barrier(&self) -> Result<()> {
        let round = self.barrier_round.load(Ordering::SeqCst);
        let state = self.shared.state.lock();
        if state.barrier_expired(round) {
            return Err(self.timed_out());
        }
        match state.barriers.get(&round) {
            Some(entry) if !entry.released && entry.opened_at.elapsed() > self.timeout => {
                Err(self.timed_out())
            }
            _ => Ok(()),
        }
    }
}
