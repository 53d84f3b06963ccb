#![allow(dead_code)]

use reading_service::{current_worker, DataPipe, DataSource, IterableWrapper};

use anyhow::{anyhow, Result};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Test data source that yields predefined numbers.
pub struct TestDataSource {
    pub data: Vec<u32>,
}

impl DataSource<u32> for TestDataSource {
    fn stream(&self) -> Result<Box<dyn Iterator<Item = Result<u32>> + Send>> {
        Ok(Box::new(self.data.clone().into_iter().map(Ok)))
    }
}

/// Data source whose stream yields one good item, then a read error.
pub struct CorruptDataSource;

impl DataSource<u32> for CorruptDataSource {
    fn stream(&self) -> Result<Box<dyn Iterator<Item = Result<u32>> + Send>> {
        let items = vec![Ok(1000), Err(anyhow!("corrupt record"))];
        Ok(Box::new(items.into_iter()))
    }
}

/// Where an item was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin {
    pub thread: ThreadId,
    pub worker: Option<usize>,
}

/// Wraps a pipeline and tags every item with the thread that produced it.
#[derive(Clone)]
pub struct Tagged<P> {
    pub inner: P,
}

impl<P: DataPipe> DataPipe for Tagged<P> {
    type Item = (P::Item, Origin);
    type Iter = Box<dyn Iterator<Item = Result<Self::Item>> + Send>;

    fn iter(&self) -> Self::Iter {
        Box::new(self.inner.iter().map(|item| {
            item.map(|value| {
                let origin = Origin {
                    thread: thread::current().id(),
                    worker: current_worker().map(|info| info.id),
                };
                (value, origin)
            })
        }))
    }

    fn apply_sharding(&mut self, num_shards: usize, shard_index: usize) {
        self.inner.apply_sharding(num_shards, shard_index);
    }

    fn apply_seed(&mut self, seed: u64) {
        self.inner.apply_seed(seed);
    }
}

/// Pipeline that panics when it reaches `poison`.
#[derive(Clone)]
pub struct Poisoned {
    pub inner: IterableWrapper<u32>,
    pub poison: u32,
}

impl DataPipe for Poisoned {
    type Item = u32;
    type Iter = Box<dyn Iterator<Item = Result<u32>> + Send>;

    fn iter(&self) -> Self::Iter {
        let poison = self.poison;
        Box::new(self.inner.iter().map(move |item| match item {
            Ok(value) if value == poison => panic!("poisoned item {}", value),
            other => other,
        }))
    }

    fn apply_sharding(&mut self, num_shards: usize, shard_index: usize) {
        self.inner.apply_sharding(num_shards, shard_index);
    }
}

/// Pipeline that sleeps before every item.
#[derive(Clone)]
pub struct Slow<P> {
    pub inner: P,
    pub delay: Duration,
}

impl<P: DataPipe> DataPipe for Slow<P> {
    type Item = P::Item;
    type Iter = Box<dyn Iterator<Item = Result<P::Item>> + Send>;

    fn iter(&self) -> Self::Iter {
        let delay = self.delay;
        Box::new(self.inner.iter().inspect(move |_| thread::sleep(delay)))
    }

    fn apply_sharding(&mut self, num_shards: usize, shard_index: usize) {
        self.inner.apply_sharding(num_shards, shard_index);
    }

    fn apply_seed(&mut self, seed: u64) {
        self.inner.apply_seed(seed);
    }
}

pub fn numbers(count: u32) -> IterableWrapper<u32> {
    IterableWrapper::new((0..count).collect())
}
