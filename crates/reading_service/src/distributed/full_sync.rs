//! Cross-rank end-of-pass synchronization.

use std::sync::Arc;
use tracing::{debug, error};

use super::runtime::ProcessGroup;
use crate::error::Result;

/// Ends a pass on every rank together.
///
/// Items pass through unchanged. When the inner stream runs out, the rank
/// enters a barrier and only ends its stream once every rank has run out.
/// A rank that has not finished yet checks before each item whether a peer's
/// barrier already expired, so a stalled pass fails on all ranks.
pub struct FullSync<I> {
    inner: I,
    group: Option<Arc<dyn ProcessGroup>>,
    done: bool,
}

impl<I> FullSync<I> {
    pub fn new(inner: I, group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            inner,
            group: Some(group),
            done: false,
        }
    }

    /// Passes the inner stream through without any synchronization.
    pub fn passthrough(inner: I) -> Self {
        Self {
            inner,
            group: None,
            done: false,
        }
    }
}

impl<I, T> Iterator for FullSync<I>
where
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(group) = &self.group else {
            return self.inner.next();
        };

        if let Err(e) = group.check_barrier() {
            error!(rank = group.rank(), "Peer rank gave up waiting: {}", e);
            self.done = true;
            return Some(Err(e));
        }

        match self.inner.next() {
            Some(Ok(item)) => Some(Ok(item)),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                debug!(rank = group.rank(), "Local pass exhausted, waiting for peers");
                match group.barrier() {
                    Ok(()) => None,
                    Err(e) => {
                        error!(rank = group.rank(), "End-of-pass barrier failed: {}", e);
                        Some(Err(e))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectiveBackend;
    use crate::distributed::{CollectiveRuntime, HostRuntime};
    use crate::error::ReadingServiceError;
    use std::thread;
    use std::time::{Duration, Instant};

    fn items(count: u32) -> impl Iterator<Item = Result<u32>> {
        (0..count).map(Ok)
    }

    #[test]
    fn test_passthrough_does_not_synchronize() -> Result<()> {
        let out: Vec<_> = FullSync::passthrough(items(3)).collect::<Result<_>>()?;
        assert_eq!(out, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_fast_rank_waits_for_slow_rank() {
        let handles: Vec<_> = HostRuntime::world(2)
            .into_iter()
            .map(|runtime| {
                thread::spawn(move || {
                    runtime.start();
                    let group = runtime
                        .new_group(CollectiveBackend::Host, Duration::from_secs(5))
                        .unwrap();
                    let delay = Duration::from_millis(if runtime.rank() == 0 { 0 } else { 10 });
                    let slow = items(5).inspect(move |_| thread::sleep(delay));
                    let stream = FullSync::new(slow, group);
                    let count = stream.map(|item| item.unwrap()).count();
                    (count, Instant::now())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].0, 5);
        assert_eq!(results[1].0, 5);
        // Rank 0 finished its items long before rank 1 but could not end first.
        assert!(results[0].1 + Duration::from_millis(5) >= results[1].1);
    }

    #[test]
    fn test_rank_finishing_after_deadline_still_times_out() {
        let handles: Vec<_> = HostRuntime::world(2)
            .into_iter()
            .map(|runtime| {
                thread::spawn(move || {
                    runtime.start();
                    let group = runtime
                        .new_group(CollectiveBackend::Host, Duration::from_millis(30))
                        .unwrap();
                    let inner: Box<dyn Iterator<Item = Result<u32>> + Send> =
                        if runtime.rank() == 0 {
                            Box::new(std::iter::empty::<Result<u32>>())
                        } else {
                            Box::new(std::iter::from_fn(|| {
                                thread::sleep(Duration::from_millis(100));
                                None::<Result<u32>>
                            }))
                        };
                    FullSync::new(inner, group).collect::<Vec<_>>()
                })
            })
            .collect();

        for (rank, handle) in handles.into_iter().enumerate() {
            let out = handle.join().unwrap();
            assert_eq!(out.len(), 1, "rank {}", rank);
            let err = out[0].as_ref().unwrap_err();
            assert!(err.is_timeout(), "rank {}: {}", rank, err);
        }
    }

    #[test]
    fn test_inner_error_skips_barrier() {
        let group = HostRuntime::world(2)
            .into_iter()
            .map(|runtime| {
                runtime.start();
                runtime
                    .new_group(CollectiveBackend::Host, Duration::from_secs(5))
                    .unwrap()
            })
            .next()
            .unwrap();

        let failing = vec![
            Ok(1u32),
            Err(ReadingServiceError::Precondition("broken".into())),
            Ok(2),
        ];
        let mut stream = FullSync::new(failing.into_iter(), group);
        assert_eq!(stream.next().unwrap().unwrap(), 1);
        assert!(stream.next().unwrap().is_err());
        // Ends immediately rather than blocking in a barrier nobody will join.
        assert!(stream.next().is_none());
    }
}
