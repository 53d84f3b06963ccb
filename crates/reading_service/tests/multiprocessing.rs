//! Worker pool tests through the `DataLoader`.
//!
//! Tests cover:
//! - Partitioning: every item exactly once across workers
//! - Epochs: reset reproduces the data, persistent vs per-pass workers
//! - Worker identity and the init hook
//! - Failure handling: panics, failed init hooks, pipeline errors

mod common;
use common::{numbers, CorruptDataSource, Origin, Poisoned, Slow, Tagged, TestDataSource};
use reading_service::{
    Component, DataLoader, DataSource, MultiProcessingConfig, MultiProcessingReadingService,
    PollMode, ReadingServiceError, SourcePipe,
};

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;
use tracing_test::traced_test;

fn config(num_workers: usize, persistent: bool) -> MultiProcessingConfig {
    MultiProcessingConfig::builder()
        .num_workers(num_workers)
        .persistent_workers(persistent)
        .build()
}

// ============================================================================
// 1. Partitioning
// ============================================================================

#[test]
fn test_workers_yield_every_item_exactly_once() -> Result<()> {
    let service = MultiProcessingReadingService::new(config(4, false));
    let mut loader = DataLoader::new(numbers(100), service);

    let mut items: Vec<u32> = loader.iter()?.collect::<reading_service::Result<_>>()?;
    items.sort();
    assert_eq!(items, (0..100).collect::<Vec<_>>());
    loader.shutdown()?;
    Ok(())
}

#[test]
fn test_item_is_produced_by_owning_worker() -> Result<()> {
    let pipe = Tagged { inner: numbers(30) };
    let service = MultiProcessingReadingService::new(config(3, false));
    let mut loader = DataLoader::new(pipe, service);

    for item in loader.iter()? {
        let (value, origin) = item?;
        assert_eq!(origin.worker, Some(value as usize % 3));
    }
    Ok(())
}

#[test]
fn test_more_workers_than_sources() -> Result<()> {
    let sources: Vec<Box<dyn DataSource<u32>>> = vec![
        Box::new(TestDataSource { data: vec![1, 2] }),
        Box::new(TestDataSource { data: vec![3] }),
    ];
    let service = MultiProcessingReadingService::new(config(4, false));
    let mut loader = DataLoader::new(SourcePipe::new(sources), service);

    let mut items: Vec<u32> = loader.iter()?.collect::<reading_service::Result<_>>()?;
    items.sort();
    assert_eq!(items, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn test_readiness_polling_yields_the_same_union() -> Result<()> {
    let config = MultiProcessingConfig::builder()
        .num_workers(3)
        .poll_mode(PollMode::Readiness)
        .poll_interval(Duration::from_millis(5))
        .build();
    let pipe = Slow {
        inner: numbers(24),
        delay: Duration::from_millis(1),
    };
    let mut loader = DataLoader::new(pipe, MultiProcessingReadingService::new(config));

    let mut items: Vec<u32> = loader.iter()?.collect::<reading_service::Result<_>>()?;
    items.sort();
    assert_eq!(items, (0..24).collect::<Vec<_>>());
    Ok(())
}

// ============================================================================
// 2. Epochs
// ============================================================================

#[test]
fn test_reset_reproduces_each_epoch() -> Result<()> {
    let service = MultiProcessingReadingService::new(config(3, true));
    let mut loader = DataLoader::new(numbers(50), service);

    for _ in 0..3 {
        let mut items: Vec<u32> = loader.iter()?.collect::<reading_service::Result<_>>()?;
        items.sort();
        assert_eq!(items, (0..50).collect::<Vec<_>>());
    }
    assert_eq!(loader.epoch(), 3);
    Ok(())
}

#[test]
fn test_abandoned_epoch_restarts_from_the_beginning() -> Result<()> {
    let service = MultiProcessingReadingService::new(config(2, true));
    let mut loader = DataLoader::new(numbers(20), service);

    let partial = loader.iter()?.take(5).count();
    assert_eq!(partial, 5);

    let full = loader.iter()?.collect::<reading_service::Result<Vec<_>>>()?;
    assert_eq!(full.len(), 20);
    Ok(())
}

fn threads_per_epoch(persistent: bool) -> Result<Vec<HashSet<ThreadId>>> {
    let pipe = Tagged { inner: numbers(12) };
    let service = MultiProcessingReadingService::new(config(2, persistent));
    let mut loader = DataLoader::new(pipe, service);

    let mut epochs = Vec::new();
    for _ in 0..2 {
        let origins: Vec<Origin> = loader
            .iter()?
            .map(|item| item.map(|(_, origin)| origin))
            .collect::<reading_service::Result<_>>()?;
        epochs.push(origins.into_iter().map(|origin| origin.thread).collect());
    }
    loader.shutdown()?;
    Ok(epochs)
}

#[test]
fn test_persistent_workers_are_reused() -> Result<()> {
    let epochs = threads_per_epoch(true)?;
    assert_eq!(epochs[0].len(), 2);
    assert_eq!(epochs[0], epochs[1]);
    Ok(())
}

#[test]
fn test_non_persistent_workers_are_respawned() -> Result<()> {
    let epochs = threads_per_epoch(false)?;
    assert_eq!(epochs[0].len(), 2);
    assert!(epochs[0].is_disjoint(&epochs[1]));
    Ok(())
}

#[test]
fn test_init_hook_runs_once_per_persistent_worker() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let config = {
        let calls = calls.clone();
        let seen = seen.clone();
        MultiProcessingConfig::builder()
            .num_workers(3)
            .persistent_workers(true)
            .worker_init_fn(move |info| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().map_err(|_| anyhow!("poisoned"))?.push(info);
                Ok(())
            })
            .build()
    };
    let mut loader = DataLoader::new(numbers(9), MultiProcessingReadingService::new(config));
    for _ in 0..2 {
        assert_eq!(loader.iter()?.count(), 9);
    }
    loader.shutdown()?;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let mut ids: Vec<_> = seen
        .lock()
        .map_err(|_| anyhow!("poisoned"))?
        .iter()
        .map(|info| (info.id, info.num_workers))
        .collect();
    ids.sort();
    assert_eq!(ids, vec![(0, 3), (1, 3), (2, 3)]);
    Ok(())
}

// ============================================================================
// 3. Failures
// ============================================================================

#[test]
#[traced_test]
fn test_worker_panic_is_reported_as_crash() -> Result<()> {
    let pipe = Poisoned {
        inner: numbers(20),
        poison: 7, // owned by worker 1
    };
    let service = MultiProcessingReadingService::new(config(2, true));
    let mut loader = DataLoader::new(pipe, service);

    let err = loader
        .iter()?
        .find_map(|item| item.err())
        .ok_or_else(|| anyhow!("expected the pass to fail"))?;
    match err {
        ReadingServiceError::WorkerCrash { worker, .. } => assert_eq!(worker, 1),
        other => panic!("unexpected error: {}", other),
    }

    // The crashed worker is still cleaned up; its failure is reported again.
    assert!(loader.shutdown().is_err());
    Ok(())
}

#[test]
#[traced_test]
fn test_failed_init_hook_is_a_crash() -> Result<()> {
    let config = MultiProcessingConfig::builder()
        .num_workers(2)
        .worker_init_fn(|info| {
            if info.id == 1 {
                return Err(anyhow!("no device for worker {}", info.id));
            }
            Ok(())
        })
        .build();
    let mut loader = DataLoader::new(numbers(4), MultiProcessingReadingService::new(config));

    let err = loader.iter().err().ok_or_else(|| anyhow!("expected reset to fail"))?;
    assert!(matches!(err, ReadingServiceError::WorkerCrash { worker: 1, .. }));
    Ok(())
}

#[test]
fn test_pipeline_error_names_the_worker() -> Result<()> {
    let sources: Vec<Box<dyn DataSource<u32>>> = vec![
        Box::new(TestDataSource { data: vec![1, 2, 3] }),
        Box::new(CorruptDataSource),
    ];
    let service = MultiProcessingReadingService::new(config(2, false));
    let mut loader = DataLoader::new(SourcePipe::new(sources), service);

    let results: Vec<_> = loader.iter()?.collect();
    let errors: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].component(), Some(Component::Worker(1)));
    // The pass ends with the error.
    assert!(results.last().is_some_and(|r| r.is_err()));
    Ok(())
}
