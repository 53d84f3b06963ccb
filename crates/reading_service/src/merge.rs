//! src/merge.rs
//!
//! Fair merge over the workers of a pool.
//!
//! # Algorithm
//! Scan the non-excluded workers in pool order, starting at the cursor, and
//! call `try_next()` on each:
//! - `Value`: yield it and move the cursor past that worker, so every active
//!   worker contributes one item per cycle.
//! - `EndOfStream`: exclude the worker for the rest of the pass.
//! - `Busy`: leave it for the next scan.
//!
//! A scan that yields nothing means every active worker was busy; the loop
//! then waits (`PollMode`) before rescanning. The stream ends once every
//! worker is excluded. Any error ends the pass: it is yielded once and the
//! stream is fused afterwards.
//!
//! A `MergedStream` is not restartable. A new pass needs
//! `WorkerPool::initialize_iteration()` followed by a fresh `WorkerPool::iter()`.

use crossbeam_channel::Select;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::config::PollMode;
use crate::error::Result;
use crate::worker::{TryNext, WorkerHandle};

/// Single logical stream over all workers of a pool.
///
/// Borrows the pool's workers for polling only; the pool keeps ownership.
pub struct MergedStream<'a, T> {
    workers: &'a mut [WorkerHandle<T>],
    excluded: Vec<bool>,
    active: usize,
    cursor: usize,
    poll_interval: Duration,
    poll_mode: PollMode,
    fused: bool,
}

impl<'a, T> MergedStream<'a, T> {
    pub(crate) fn new(
        workers: &'a mut [WorkerHandle<T>],
        poll_interval: Duration,
        poll_mode: PollMode,
    ) -> Self {
        let count = workers.len();
        Self {
            workers,
            excluded: vec![false; count],
            active: count,
            cursor: 0,
            poll_interval,
            poll_mode,
            fused: false,
        }
    }

    /// Number of workers not yet exhausted in this pass.
    pub fn active_workers(&self) -> usize {
        self.active
    }

    fn wait_for_progress(&self) {
        match self.poll_mode {
            PollMode::Backoff => thread::sleep(self.poll_interval),
            PollMode::Readiness => {
                let mut select = Select::new();
                for (worker, excluded) in self.workers.iter().zip(&self.excluded) {
                    if !excluded {
                        select.recv(worker.receiver());
                    }
                }
                // Readiness only wakes us early; the next scan does the reads.
                let _ = select.ready_timeout(self.poll_interval);
            }
        }
    }
}

impl<T> Iterator for MergedStream<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }

        let count = self.workers.len();
        while self.active > 0 {
            for step in 0..count {
                let index = (self.cursor + step) % count;
                if self.excluded[index] {
                    continue;
                }

                match self.workers[index].try_next() {
                    Ok(TryNext::Value(value)) => {
                        self.cursor = (index + 1) % count;
                        return Some(Ok(value));
                    }
                    Ok(TryNext::EndOfStream) => {
                        self.excluded[index] = true;
                        self.active -= 1;
                        debug!(
                            worker = self.workers[index].id(),
                            remaining = self.active,
                            "Worker exhausted"
                        );
                    }
                    Ok(TryNext::Busy) => {}
                    Err(e) => {
                        self.fused = true;
                        return Some(Err(e));
                    }
                }
            }

            if self.active > 0 {
                self.wait_for_progress();
            }
        }

        self.fused = true;
        None
    }
}
