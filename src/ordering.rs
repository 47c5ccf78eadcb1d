//! Ordered emitter: bounded-memory external sort with a k-way merge.
//!
//! Input arrives in arbitrary order. It is cut into batches of
//! `batch_size`, each batch is stably sorted by its key, and sorted runs are
//! merged through a min-heap keyed by `(key, run index)`. Because runs are
//! created in arrival order and each run is sorted stably, ties come out in
//! arrival order.
//!
//! At most `max_memory_runs` runs stay resident; later runs are written to a
//! [`SpoolFile`] and streamed back during the merge, so resident memory is
//! bounded by `batch_size * (max_memory_runs + 1)` plus one head per spilled run.
//!
//! ```
//! use ironseries::ordering::{SortConfig, order_records};
//! use ironseries::record::TemporalRecord;
//!
//! let input = [3, 1, 2].map(|h| Ok(TemporalRecord::new(h * 3_600_000)));
//! let out: Vec<_> = order_records(input.into_iter(), Vec::new(), SortConfig::with_batch_size(2))
//!     .collect::<anyhow::Result<_>>()?;
//! assert_eq!(out.iter().map(|r| r.time / 3_600_000).collect::<Vec<_>>(), vec![1, 2, 3]);
//! # anyhow::Ok(())
//! ```

use crate::error::EngineError;
use crate::metrics::{Counter, RunMetrics};
use crate::record::{RecordStream, TemporalRecord};
use crate::spool::{SpoolFile, SpoolReader};
use crate::window::TimestampMs;
use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_SORT_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_MAX_MEMORY_RUNS: usize = 8;

/// Knobs for the external sort.
#[derive(Clone, Debug)]
pub struct SortConfig {
    /// Records per sorted run.
    pub batch_size: usize,
    /// Runs kept in memory before further runs spill to disk.
    pub max_memory_runs: usize,
    /// Sort each batch with rayon's stable parallel sort.
    pub parallel: bool,
    /// Directory for spilled runs; the system temp dir when `None`.
    pub spill_dir: Option<PathBuf>,
    pub metrics: Option<RunMetrics>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SORT_BATCH_SIZE,
            max_memory_runs: DEFAULT_MAX_MEMORY_RUNS,
            parallel: false,
            spill_dir: None,
            metrics: None,
        }
    }
}

impl SortConfig {
    #[must_use]
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self { batch_size: batch_size.max(1), ..Self::default() }
    }
}

/* ===================== runs ===================== */

enum Run<T, K> {
    Memory(std::vec::IntoIter<(K, T)>),
    Spilled(SpoolReader<T>),
}

struct HeapEntry<K, T> {
    key: K,
    run: usize,
    item: T,
}

impl<K: Ord, T> PartialEq for HeapEntry<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl<K: Ord, T> Eq for HeapEntry<K, T> {}
impl<K: Ord, T> PartialOrd for HeapEntry<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<K: Ord, T> Ord for HeapEntry<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.run.cmp(&other.run))
    }
}

enum State<I, T, K> {
    Pending(I),
    Merging {
        runs: Vec<Run<T, K>>,
        heap: BinaryHeap<Reverse<HeapEntry<K, T>>>,
    },
    Done,
}

/// Lazily sorted stream. Nothing is read from upstream until the first pull.
pub struct ExternalSorter<I, T, K, F> {
    state: State<I, T, K>,
    key_fn: F,
    config: SortConfig,
}

impl<I, T, K, F> ExternalSorter<I, T, K, F>
where
    I: Iterator<Item = Result<T>>,
    T: Serialize + DeserializeOwned + Send,
    K: Ord + Send,
    F: Fn(&T) -> K + Sync,
{
    pub fn new(input: I, key_fn: F, config: SortConfig) -> Self {
        Self { state: State::Pending(input), key_fn, config }
    }

    fn sort_batch(&self, batch: Vec<T>) -> Vec<(K, T)> {
        let mut keyed: Vec<(K, T)> = batch.into_iter().map(|t| ((self.key_fn)(&t), t)).collect();
        if self.config.parallel {
            keyed.par_sort_by(|a, b| a.0.cmp(&b.0));
        } else {
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
        }
        keyed
    }

    fn seal(&self, batch: Vec<T>, runs: &mut Vec<Run<T, K>>, resident: &mut usize) -> Result<()> {
        let sorted = self.sort_batch(batch);
        if *resident < self.config.max_memory_runs {
            *resident += 1;
            runs.push(Run::Memory(sorted.into_iter()));
            return Ok(());
        }
        let mut spool = match &self.config.spill_dir {
            Some(dir) => SpoolFile::new_in(dir)?,
            None => SpoolFile::new()?,
        };
        spool.extend(sorted.iter().map(|(_, t)| t))?;
        if let Some(m) = &self.config.metrics {
            m.increment(Counter::RecordsSpooled, spool.frames());
        }
        debug!(run = runs.len(), frames = spool.frames(), bytes = spool.bytes(), "sort run spilled");
        runs.push(Run::Spilled(spool.into_reader()?));
        Ok(())
    }

    fn build_runs(&self, input: I) -> Result<Vec<Run<T, K>>> {
        let batch_size = self.config.batch_size.max(1);
        let mut runs = Vec::new();
        let mut resident = 0usize;
        let mut batch = Vec::with_capacity(batch_size.min(DEFAULT_SORT_BATCH_SIZE));
        for item in input {
            batch.push(item?);
            if batch.len() == batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size.min(DEFAULT_SORT_BATCH_SIZE)));
                self.seal(full, &mut runs, &mut resident)?;
            }
        }
        if !batch.is_empty() {
            self.seal(batch, &mut runs, &mut resident)?;
        }
        debug!(runs = runs.len(), resident, "sort runs built");
        Ok(runs)
    }

    fn pull(&self, run: &mut Run<T, K>) -> Result<Option<(K, T)>> {
        match run {
            Run::Memory(it) => Ok(it.next()),
            Run::Spilled(reader) => match reader.next() {
                Some(item) => {
                    let item = item?;
                    Ok(Some(((self.key_fn)(&item), item)))
                }
                None => Ok(None),
            },
        }
    }

    fn start(&mut self, input: I) -> Result<()> {
        let mut runs = self.build_runs(input)?;
        let mut heap = BinaryHeap::with_capacity(runs.len());
        for (idx, run) in runs.iter_mut().enumerate() {
            if let Some((key, item)) = self.pull(run)? {
                heap.push(Reverse(HeapEntry { key, run: idx, item }));
            }
        }
        self.state = State::Merging { runs, heap };
        Ok(())
    }

    fn step(&mut self) -> Result<Option<T>> {
        let State::Merging { runs, heap } = &mut self.state else {
            return Ok(None);
        };
        let Some(Reverse(head)) = heap.pop() else {
            return Ok(None);
        };
        let refill = match runs.get_mut(head.run) {
            Some(Run::Memory(it)) => it.next(),
            Some(Run::Spilled(reader)) => match reader.next() {
                Some(item) => {
                    let item = item?;
                    Some(((self.key_fn)(&item), item))
                }
                None => None,
            },
            None => None,
        };
        if let Some((key, item)) = refill {
            heap.push(Reverse(HeapEntry { key, run: head.run, item }));
        }
        Ok(Some(head.item))
    }
}

impl<I, T, K, F> Iterator for ExternalSorter<I, T, K, F>
where
    I: Iterator<Item = Result<T>>,
    T: Serialize + DeserializeOwned + Send,
    K: Ord + Send,
    F: Fn(&T) -> K + Sync,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, State::Pending(_)) {
            let State::Pending(input) = std::mem::replace(&mut self.state, State::Done) else {
                return None;
            };
            if let Err(e) = self.start(input) {
                self.state = State::Done;
                return Some(Err(e));
            }
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.state = State::Done;
                None
            }
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}

/* ===================== record ordering ===================== */

/// Sort key of a record: `(partition key, time)`.
pub type RecordKey = (String, TimestampMs);

/// Sort a record stream by `(partition key, time)`, stable on ties.
pub fn order_records<I>(input: I, partition_by: Vec<String>, config: SortConfig) -> RecordStream
where
    I: Iterator<Item = Result<TemporalRecord>> + Send + 'static,
{
    Box::new(ExternalSorter::new(
        input,
        move |r: &TemporalRecord| (r.partition_key(&partition_by), r.time),
        config,
    ))
}

/* ===================== guard ===================== */

/// Passes items through while asserting their keys never decrease.
///
/// A decrease is an [`EngineError::Ordering`] attributed to `stage`; the
/// stream ends after reporting it.
pub struct OrderGuard<I, K, F> {
    inner: Option<I>,
    key_fn: F,
    last: Option<K>,
    stage: &'static str,
}

impl<I, K, F> OrderGuard<I, K, F> {
    pub const fn new(inner: I, stage: &'static str, key_fn: F) -> Self {
        Self { inner: Some(inner), key_fn, last: None, stage }
    }
}

impl<I, T, K, F> Iterator for OrderGuard<I, K, F>
where
    I: Iterator<Item = Result<T>>,
    K: Ord + std::fmt::Debug,
    F: FnMut(&T) -> K,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.inner.as_mut()?.next() {
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                self.inner = None;
                return Some(Err(e));
            }
            None => {
                self.inner = None;
                return None;
            }
        };
        let key = (self.key_fn)(&item);
        if let Some(prev) = &self.last
            && key < *prev
        {
            self.inner = None;
            return Some(Err(EngineError::ordering(
                self.stage,
                format!("key {key:?} arrived after {prev:?}"),
            )
            .into()));
        }
        self.last = Some(key);
        Some(Ok(item))
    }
}
