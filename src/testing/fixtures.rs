//! Fixtures: an instrumented loader and a small project.

use crate::config::ProjectConfig;
use crate::record::{RecordStream, TemporalRecord};
use crate::registry::SourceFactory;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A loader over fixed records that counts how often it is opened and pulled.
///
/// Clones share their counters, so one clone can be registered while the
/// test keeps another.
///
/// ```
/// use ironseries::registry::SourceFactory;
/// use ironseries::testing::{CountingSource, RecordBuilder};
///
/// let src = CountingSource::new(vec![RecordBuilder::at(0).value(1.0).build()]);
/// let n = src.open(&serde_json::Value::Null)?.count();
/// assert_eq!((src.opens(), src.pulls(), n), (1, 1, 1));
/// # anyhow::Ok(())
/// ```
#[derive(Clone, Debug)]
pub struct CountingSource {
    records: Arc<Vec<TemporalRecord>>,
    opens: Arc<AtomicUsize>,
    pulls: Arc<AtomicUsize>,
}

impl CountingSource {
    #[must_use]
    pub fn new(records: Vec<TemporalRecord>) -> Self {
        Self { records: Arc::new(records), opens: Arc::default(), pulls: Arc::default() }
    }

    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Records handed out across all opens.
    #[must_use]
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

impl SourceFactory for CountingSource {
    fn open(&self, _params: &serde_json::Value) -> Result<RecordStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let records = Arc::clone(&self.records);
        let pulls = Arc::clone(&self.pulls);
        Ok(Box::new((0..records.len()).map(move |i| {
            pulls.fetch_add(1, Ordering::SeqCst);
            Ok(records[i].clone())
        })))
    }
}

/// A synthetic hourly project: `hours + 1` ticks from 2024-01-01, one linear
/// feature, one `hour_sin` target, and an 80/10/10 hash split with seed 42.
///
/// # Errors
/// Never for the built-in document.
pub fn hourly_project(hours: i64) -> Result<ProjectConfig> {
    let end = crate::window::format_timestamp(crate::window::parse_timestamp("2024-01-01T00:00:00Z")? + hours * super::HOUR_MS);
    let cfg = serde_json::json!({
        "contracts": [
            {"id": "clock", "source": {"loader": "synthetic",
                "params": {"start": "2024-01-01T00:00:00Z", "end": end}},
             "stream": [{"kind": "ensure_cadence", "tick": "1h"}]},
            {"id": "phase", "source": {"loader": "synthetic",
                "params": {"start": "2024-01-01T00:00:00Z", "end": end, "encode": "hour_sin"}}}
        ],
        "dataset": {
            "group_by": "1h",
            "features": [{"id": "clock", "stream": "clock"}],
            "targets": [{"id": "phase", "stream": "phase"}]
        },
        "split": {"mode": "hash", "seed": 42, "ratios": {"train": 0.8, "val": 0.1, "test": 0.1}, "output": "tag"},
        "run": {"parallel": false}
    });
    Ok(serde_json::from_value(cfg)?)
}
