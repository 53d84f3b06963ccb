//! Thread-local storage for worker identification.
//!
//! Every pool worker records who it is before its pipeline is sharded, so
//! pipelines and init hooks can specialize per worker.

use std::cell::Cell;

/// Identity of the worker running the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Worker index, `0..num_workers`. Doubles as the shard index.
    pub id: usize,
    /// Total number of workers in the pool. Doubles as the shard count.
    pub num_workers: usize,
}

thread_local! {
    /// Set once when a worker thread starts; `None` on controller threads.
    static WORKER_INFO: Cell<Option<WorkerInfo>> = const { Cell::new(None) };
}

pub(crate) fn set_current_worker(info: WorkerInfo) {
    WORKER_INFO.with(|cell| cell.set(Some(info)));
}

/// Returns the worker identity for the calling thread, if it is a pool worker.
pub fn current_worker() -> Option<WorkerInfo> {
    WORKER_INFO.with(|cell| cell.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_info_is_thread_local() {
        assert_eq!(current_worker(), None);

        let seen = std::thread::spawn(|| {
            set_current_worker(WorkerInfo {
                id: 2,
                num_workers: 4,
            });
            current_worker()
        })
        .join()
        .unwrap();

        assert_eq!(
            seen,
            Some(WorkerInfo {
                id: 2,
                num_workers: 4
            })
        );
        assert_eq!(current_worker(), None);
    }
}
