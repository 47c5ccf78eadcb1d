//! Fan-out (tee) buffer.
//!
//! A [`SharedStream`] opens its upstream at most once and lets any number of
//! [`TeeReader`]s replay it independently. Records that some reader has not
//! consumed yet are retained: the newest `memory_limit` in memory, older ones
//! spooled to a temporary file. Once every live reader has passed a record it
//! is released. Dropping a reader releases its hold on the buffer.
//!
//! ```
//! use ironseries::fanout::SharedStream;
//! use ironseries::record::{TemporalRecord, boxed};
//!
//! let shared = SharedStream::new("prices", 2, || {
//!     Ok(boxed((0..5).map(|h| Ok(TemporalRecord::new(h * 3_600_000)))))
//! });
//! let fast = shared.reader()?;
//! let slow = shared.reader()?;
//! let a: Vec<_> = fast.collect::<anyhow::Result<_>>()?;
//! let b: Vec<_> = slow.collect::<anyhow::Result<_>>()?;
//! assert_eq!(a, b);
//! assert_eq!(shared.opens(), 1);
//! # anyhow::Ok(())
//! ```

use crate::error::EngineError;
use crate::metrics::{Counter, RunMetrics};
use crate::record::{RecordStream, TemporalRecord};
use crate::spool::SpoolFile;
use anyhow::{Result, anyhow};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Records kept in memory per shared stream before older ones spill to disk.
pub const DEFAULT_MEMORY_LIMIT: usize = 10_000;

type Opener = Box<dyn FnOnce() -> Result<RecordStream> + Send>;

struct Shared {
    stream_id: String,
    opener: Option<Opener>,
    upstream: Option<RecordStream>,
    opens: usize,
    finished: bool,
    failure: Option<String>,
    /// Total records pulled from upstream; the next record gets this index.
    produced: u64,
    /// Oldest retained index; everything before it has been released.
    retained_start: u64,
    /// Index of `memory[0]`; indices in `retained_start..memory_start` live on disk.
    memory_start: u64,
    memory: VecDeque<TemporalRecord>,
    memory_limit: usize,
    spill: Option<SpoolFile<TemporalRecord>>,
    spill_offsets: VecDeque<u64>,
    spill_dir: Option<PathBuf>,
    cursors: Vec<Option<u64>>,
    metrics: Option<RunMetrics>,
}

impl Shared {
    fn open(&mut self) -> Result<()> {
        if self.upstream.is_some() || self.finished {
            return Ok(());
        }
        let Some(opener) = self.opener.take() else {
            return Ok(());
        };
        debug!(stream = %self.stream_id, "opening shared upstream");
        self.opens += 1;
        self.upstream = Some(opener()?);
        Ok(())
    }

    fn fetch(&mut self, idx: u64) -> Result<TemporalRecord> {
        if idx >= self.memory_start {
            let pos = usize::try_from(idx - self.memory_start)?;
            return self
                .memory
                .get(pos)
                .cloned()
                .ok_or_else(|| anyhow!("fan-out buffer lost record {idx} of `{}`", self.stream_id));
        }
        let pos = usize::try_from(idx - self.retained_start)?;
        let offset = *self
            .spill_offsets
            .get(pos)
            .ok_or_else(|| anyhow!("fan-out spool lost record {idx} of `{}`", self.stream_id))?;
        let spool = self
            .spill
            .as_mut()
            .ok_or_else(|| EngineError::Resource(format!("fan-out spool of `{}` is gone", self.stream_id)))?;
        Ok(spool.read_at(offset)?.0)
    }

    fn store(&mut self, rec: TemporalRecord) -> Result<()> {
        self.memory.push_back(rec);
        self.produced += 1;
        while self.memory.len() > self.memory_limit {
            let Some(oldest) = self.memory.pop_front() else {
                break;
            };
            if self.spill.is_none() {
                self.spill = Some(match &self.spill_dir {
                    Some(dir) => SpoolFile::new_in(dir)?,
                    None => SpoolFile::new()?,
                });
                debug!(stream = %self.stream_id, "fan-out buffer spilling to disk");
            }
            if let Some(spool) = self.spill.as_mut() {
                let offset = spool.append(&oldest).map_err(|e| {
                    e.context(format!("fan-out of `{}` requires serializable records", self.stream_id))
                })?;
                self.spill_offsets.push_back(offset);
            }
            self.memory_start += 1;
            if let Some(m) = &self.metrics {
                m.increment(Counter::RecordsSpooled, 1);
            }
        }
        Ok(())
    }

    /// Release everything every live reader has passed.
    fn trim(&mut self) {
        let min = self.cursors.iter().flatten().copied().min().unwrap_or(self.produced);
        while self.retained_start < min {
            if self.retained_start < self.memory_start {
                self.spill_offsets.pop_front();
            } else {
                self.memory.pop_front();
                self.memory_start += 1;
            }
            self.retained_start += 1;
        }
        if self.spill.is_some() && self.spill_offsets.is_empty() {
            self.spill = None;
        }
    }

    fn next_for(&mut self, reader: usize) -> Option<Result<TemporalRecord>> {
        let idx = self.cursors.get(reader).copied().flatten()?;
        if idx < self.produced {
            let rec = self.fetch(idx);
            self.advance(reader, idx);
            return Some(rec);
        }
        if let Some(msg) = &self.failure {
            let err = anyhow!("shared stream `{}` failed upstream: {msg}", self.stream_id);
            self.cursors[reader] = None;
            return Some(Err(err));
        }
        if self.finished {
            return None;
        }
        if let Err(e) = self.open() {
            self.fail(&e);
            self.cursors[reader] = None;
            return Some(Err(e));
        }
        let pulled = self.upstream.as_mut().and_then(Iterator::next);
        match pulled {
            Some(Ok(rec)) => {
                let out = rec.clone();
                if let Err(e) = self.store(rec) {
                    self.fail(&e);
                    self.cursors[reader] = None;
                    return Some(Err(e));
                }
                self.advance(reader, idx);
                Some(Ok(out))
            }
            Some(Err(e)) => {
                self.fail(&e);
                self.cursors[reader] = None;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                self.upstream = None;
                None
            }
        }
    }

    fn advance(&mut self, reader: usize, idx: u64) {
        if let Some(c) = self.cursors.get_mut(reader) {
            *c = Some(idx + 1);
        }
        self.trim();
    }

    fn fail(&mut self, e: &anyhow::Error) {
        self.failure = Some(format!("{e:#}"));
        self.finished = true;
        self.upstream = None;
    }
}

/// One upstream stream shared by many readers.
#[derive(Clone)]
pub struct SharedStream {
    shared: Arc<Mutex<Shared>>,
}

impl SharedStream {
    /// `opener` is invoked at most once, on the first pull from any reader.
    pub fn new<F>(stream_id: impl Into<String>, memory_limit: usize, opener: F) -> Self
    where
        F: FnOnce() -> Result<RecordStream> + Send + 'static,
    {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                stream_id: stream_id.into(),
                opener: Some(Box::new(opener)),
                upstream: None,
                opens: 0,
                finished: false,
                failure: None,
                produced: 0,
                retained_start: 0,
                memory_start: 0,
                memory: VecDeque::new(),
                memory_limit: memory_limit.max(1),
                spill: None,
                spill_offsets: VecDeque::new(),
                spill_dir: None,
                cursors: Vec::new(),
                metrics: None,
            })),
        }
    }

    #[must_use]
    pub fn with_metrics(self, metrics: RunMetrics) -> Self {
        self.lock().metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_spill_dir(self, dir: PathBuf) -> Self {
        self.lock().spill_dir = Some(dir);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new reader positioned at the first record.
    ///
    /// # Errors
    /// Fails when records have already been released, since the new reader
    /// could not observe the full sequence.
    pub fn reader(&self) -> Result<TeeReader> {
        let mut s = self.lock();
        if s.retained_start > 0 {
            return Err(EngineError::Resource(format!(
                "cannot attach a reader to `{}` after {} records were released",
                s.stream_id, s.retained_start
            ))
            .into());
        }
        s.cursors.push(Some(0));
        let id = s.cursors.len() - 1;
        drop(s);
        Ok(TeeReader { shared: Arc::clone(&self.shared), id })
    }

    /// How many times the upstream has been opened (0 or 1).
    #[must_use]
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Records currently retained on disk.
    #[must_use]
    pub fn spilled(&self) -> usize {
        self.lock().spill_offsets.len()
    }

    /// Records currently retained in memory.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.lock().memory.len()
    }
}

/// An independent cursor over a [`SharedStream`].
pub struct TeeReader {
    shared: Arc<Mutex<Shared>>,
    id: usize,
}

impl Iterator for TeeReader {
    type Item = Result<TemporalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner).next_for(self.id)
    }
}

impl Drop for TeeReader {
    fn drop(&mut self) {
        let mut s = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = s.cursors.get_mut(self.id) {
            *c = None;
        }
        s.trim();
    }
}
