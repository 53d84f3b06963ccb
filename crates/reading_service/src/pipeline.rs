//! src/pipeline.rs
//!
//! The pipeline boundary consumed by reading services.
//!
//! A reading service never looks inside a pipeline. It only needs to:
//! - start a fresh pass (`iter`)
//! - restrict the pipeline to one shard (`apply_sharding`)
//! - seed its random operations for one epoch (`apply_seed`)
//!
//! Two reference pipelines are provided:
//! - `IterableWrapper`: in-memory items, element-wise round-robin sharding,
//!   optional seeded shuffle.
//! - `SourcePipe`: a list of `DataSource` streams, source-wise round-robin
//!   sharding (worker `i` reads sources `i, i + n, ...`).
//!
//! # Sharding composition
//! Sharding an already-sharded pipe by `(n, i)` turns `(num, index)` into
//! `(num * n, index + num * i)`. Rank sharding followed by worker sharding
//! therefore partitions the data disjointly across every (rank, worker).

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// A restartable, shardable source of items.
///
/// Implementations are cloned into every worker, so cloning should be cheap
/// (share the underlying data through `Arc`).
pub trait DataPipe: Clone + Send + 'static {
    /// The item payload moved from workers to the consumer.
    type Item: Send + 'static;

    /// The iterator type produced by `iter()`.
    type Iter: Iterator<Item = Result<Self::Item>> + Send + 'static;

    /// Starts a fresh pass from the beginning.
    fn iter(&self) -> Self::Iter;

    /// Restricts this pipeline to shard `shard_index` of `num_shards`.
    fn apply_sharding(&mut self, num_shards: usize, shard_index: usize);

    /// Seeds random operations for the next pass.
    fn apply_seed(&mut self, _seed: u64) {}

    /// True if the pipeline already ends with a cross-rank full-sync stage.
    fn is_full_sync(&self) -> bool {
        false
    }
}

/// A stream of raw items, e.g. one file.
pub trait DataSource<T>: Send + Sync {
    fn stream(&self) -> Result<Box<dyn Iterator<Item = Result<T>> + Send>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sharding {
    num_shards: usize,
    shard_index: usize,
}

impl Sharding {
    const NONE: Sharding = Sharding {
        num_shards: 1,
        shard_index: 0,
    };

    fn compose(self, num_shards: usize, shard_index: usize) -> Sharding {
        debug_assert!(num_shards > 0 && shard_index < num_shards);
        Sharding {
            num_shards: self.num_shards * num_shards,
            shard_index: self.shard_index + self.num_shards * shard_index,
        }
    }

    fn owns(&self, position: usize) -> bool {
        position % self.num_shards == self.shard_index
    }
}

// ================================================================================================
// IterableWrapper
// ================================================================================================

/// In-memory pipeline over a shared slice of items.
#[derive(Clone)]
pub struct IterableWrapper<T> {
    items: Arc<[T]>,
    sharding: Sharding,
    shuffle_seed: Option<u64>,
}

impl<T> IterableWrapper<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
            sharding: Sharding::NONE,
            shuffle_seed: None,
        }
    }

    /// Shuffles the item order every pass, before sharding.
    ///
    /// The order is drawn from a seed picked now, so every clone (and
    /// therefore every worker) agrees on it until `apply_seed` replaces it.
    pub fn shuffle(mut self) -> Self {
        self.shuffle_seed = Some(rand::rng().random());
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        order
            .into_iter()
            .enumerate()
            .filter(|(position, _)| self.sharding.owns(*position))
            .map(|(_, index)| index)
            .collect()
    }
}

/// One pass over an `IterableWrapper` shard.
pub struct IterableWrapperIter<T> {
    items: Arc<[T]>,
    order: std::vec::IntoIter<usize>,
}

impl<T: Clone> Iterator for IterableWrapperIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.order.next().map(|index| Ok(self.items[index].clone()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}

impl<T> DataPipe for IterableWrapper<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;
    type Iter = IterableWrapperIter<T>;

    fn iter(&self) -> Self::Iter {
        IterableWrapperIter {
            items: self.items.clone(),
            order: self.order().into_iter(),
        }
    }

    fn apply_sharding(&mut self, num_shards: usize, shard_index: usize) {
        self.sharding = self.sharding.compose(num_shards, shard_index);
    }

    fn apply_seed(&mut self, seed: u64) {
        if self.shuffle_seed.is_some() {
            self.shuffle_seed = Some(seed);
        }
    }
}

// ================================================================================================
// SourcePipe
// ================================================================================================

/// Pipeline over a list of data sources, sharded by source.
///
/// NOTE: With more shards than sources some shards are empty. Their workers
///       answer `EndOfStream` straight away.
pub struct SourcePipe<T> {
    sources: Vec<Arc<dyn DataSource<T>>>,
    sharding: Sharding,
}

impl<T> Clone for SourcePipe<T> {
    fn clone(&self) -> Self {
        Self {
            sources: self.sources.clone(),
            sharding: self.sharding,
        }
    }
}

impl<T: Send + 'static> SourcePipe<T> {
    pub fn new(sources: Vec<Box<dyn DataSource<T>>>) -> Self {
        Self {
            sources: sources.into_iter().map(Arc::from).collect(),
            sharding: Sharding::NONE,
        }
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }
}

/// One pass over the sources owned by a `SourcePipe` shard.
pub struct SourceIter<T> {
    pending: std::vec::IntoIter<Arc<dyn DataSource<T>>>,
    current: Option<Box<dyn Iterator<Item = Result<T>> + Send>>,
}

impl<T> Iterator for SourceIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(stream) = self.current.as_mut() {
                match stream.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }

            let source = self.pending.next()?;
            match source.stream() {
                Ok(stream) => self.current = Some(stream),
                Err(e) => return Some(Err(e.context("Failed to open data source"))),
            }
        }
    }
}

impl<T: Send + 'static> DataPipe for SourcePipe<T> {
    type Item = T;
    type Iter = SourceIter<T>;

    fn iter(&self) -> Self::Iter {
        let owned: Vec<_> = self
            .sources
            .iter()
            .enumerate()
            .filter(|(position, _)| self.sharding.owns(*position))
            .map(|(_, source)| source.clone())
            .collect();

        SourceIter {
            pending: owned.into_iter(),
            current: None,
        }
    }

    fn apply_sharding(&mut self, num_shards: usize, shard_index: usize) {
        self.sharding = self.sharding.compose(num_shards, shard_index);
    }
}
