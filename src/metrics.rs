//! Run-level drop accounting.
//!
//! Non-fatal events (records rejected by a filter, duplicates removed, synthetic
//! ticks inserted, lint violations, samples dropped by postprocess) are never
//! silently swallowed: every stage increments a [`Counter`] on the shared
//! [`RunMetrics`], and the pipeline logs a one-line summary at the end of a run.
//!
//! # Example
//!
//! ```
//! use ironseries::metrics::{Counter, RunMetrics};
//!
//! let metrics = RunMetrics::new();
//! metrics.record_start();
//! metrics.increment(Counter::RecordsFiltered, 3);
//! metrics.increment(Counter::RecordsFiltered, 2);
//! metrics.record_end();
//!
//! assert_eq!(metrics.get(Counter::RecordsFiltered), 5);
//! let snapshot = metrics.summary();
//! assert_eq!(snapshot["records_filtered"], 5);
//! ```

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

/// Counted events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    /// Records read from sources.
    RecordsIn,
    /// Records rejected by a record-level filter.
    RecordsFiltered,
    /// Consecutive identical records removed by `dedupe`.
    DuplicatesDropped,
    /// Records merged away by `granularity`.
    RecordsAggregated,
    /// Null placeholders inserted by `ensure_cadence`.
    TicksInserted,
    /// Values imputed by a rolling fill.
    ValuesFilled,
    /// Cadence / identity warnings raised by debug rules.
    LintViolations,
    /// Rows skipped by the composed-stream aligner.
    RowsUnmatched,
    /// Records written to a fan-out or sort spool.
    RecordsSpooled,
    /// Events outside the declared rectangular window.
    EventsOutOfWindow,
    /// Samples assembled.
    SamplesAssembled,
    /// Samples removed by postprocess transforms.
    SamplesDropped,
    /// Samples removed by the split `keep` filter.
    SamplesSplitFiltered,
    /// Samples handed to the caller.
    SamplesEmitted,
}

impl Counter {
    pub const ALL: [Self; 14] = [
        Self::RecordsIn,
        Self::RecordsFiltered,
        Self::DuplicatesDropped,
        Self::RecordsAggregated,
        Self::TicksInserted,
        Self::ValuesFilled,
        Self::LintViolations,
        Self::RowsUnmatched,
        Self::RecordsSpooled,
        Self::EventsOutOfWindow,
        Self::SamplesAssembled,
        Self::SamplesDropped,
        Self::SamplesSplitFiltered,
        Self::SamplesEmitted,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RecordsIn => "records_in",
            Self::RecordsFiltered => "records_filtered",
            Self::DuplicatesDropped => "duplicates_dropped",
            Self::RecordsAggregated => "records_aggregated",
            Self::TicksInserted => "ticks_inserted",
            Self::ValuesFilled => "values_filled",
            Self::LintViolations => "lint_violations",
            Self::RowsUnmatched => "rows_unmatched",
            Self::RecordsSpooled => "records_spooled",
            Self::EventsOutOfWindow => "events_out_of_window",
            Self::SamplesAssembled => "samples_assembled",
            Self::SamplesDropped => "samples_dropped",
            Self::SamplesSplitFiltered => "samples_split_filtered",
            Self::SamplesEmitted => "samples_emitted",
        }
    }
}

/// Thread-safe counter set shared by every stage of one run.
#[derive(Clone, Debug, Default)]
pub struct RunMetrics {
    inner: Arc<Mutex<RunMetricsInner>>,
}

#[derive(Debug, Default)]
struct RunMetricsInner {
    counters: BTreeMap<Counter, u64>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl RunMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunMetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment(&self, counter: Counter, by: u64) {
        if by > 0 {
            *self.lock().counters.entry(counter).or_default() += by;
        }
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.lock().counters.get(&counter).copied().unwrap_or(0)
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    /// Elapsed run time, if both ends were recorded.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// All counters (zeros included) as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut out = Map::new();
        for c in Counter::ALL {
            out.insert(c.name().to_string(), json!(inner.counters.get(&c).copied().unwrap_or(0)));
        }
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            out.insert("execution_time_ms".to_string(), json!(end.duration_since(start).as_millis()));
        }
        drop(inner);
        Value::Object(out)
    }

    /// Log a one-line summary of non-zero counters and return the full snapshot.
    pub fn summary(&self) -> Value {
        let snapshot = self.to_json();
        let line = self
            .lock()
            .counters
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(c, n)| format!("{}={n}", c.name()))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "ironseries::run", summary = %line, "run finished");
        snapshot
    }

    /// Save the snapshot as pretty JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file =
            File::create(path).with_context(|| format!("create metrics file {}", path.display()))?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }
}
