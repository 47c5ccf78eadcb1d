//! Composed stream aligner.
//!
//! Merge-joins N regularized streams by `(partition key, time)`, advancing all
//! cursors in lock-step. Whenever every required input has a record at the
//! same key, the row is handed to a [`ComposeFn`] which synthesizes one record
//! of the derived stream. Rows missing a required input are skipped and
//! counted; there are no partial joins unless `required` names a subset.
//!
//! Each input must be strictly increasing in `(partition, time)`. Duplicate
//! keys (left over when no `granularity` rule collapsed them) and keys that go
//! backwards are [`EngineError::Ordering`] errors rather than silent guesses.

use crate::error::EngineError;
use crate::metrics::{Counter, RunMetrics};
use crate::ordering::RecordKey;
use crate::record::{RecordStream, TemporalRecord, Value};
use crate::window::{TimestampMs, format_timestamp};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One input of a composed stream: a canonical stream id and the alias the
/// compose function sees it under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeInput {
    pub stream: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ComposeInput {
    #[must_use]
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.stream)
    }
}

/// The records of all inputs at one `(partition, time)`, in declared input order.
#[derive(Clone, Debug, PartialEq)]
pub struct AlignedRow {
    pub partition: String,
    pub time: TimestampMs,
    pub inputs: Vec<(String, Option<TemporalRecord>)>,
}

impl AlignedRow {
    #[must_use]
    pub fn get(&self, alias: &str) -> Option<&TemporalRecord> {
        self.inputs.iter().find(|(a, _)| a == alias).and_then(|(_, r)| r.as_ref())
    }

    /// Numeric `field` of each present input, in declared order.
    pub fn values<'a>(&'a self, field: &'a str) -> impl Iterator<Item = Option<f64>> + 'a {
        self.inputs.iter().filter_map(move |(_, r)| r.as_ref().map(|r| r.numeric(field)))
    }

    /// An empty record at the row's time carrying the first present input's identity.
    #[must_use]
    pub fn template(&self) -> TemporalRecord {
        let mut out = TemporalRecord::new(self.time);
        if let Some(first) = self.inputs.iter().find_map(|(_, r)| r.as_ref()) {
            out.identity.clone_from(&first.identity);
        }
        out
    }
}

/// User-supplied synthesis of a derived record from an aligned row.
///
/// Returning `Ok(None)` skips the row.
pub trait ComposeFn: Send + Sync {
    /// # Errors
    /// Implementations may fail fatally, e.g. on missing parameters.
    fn compose(&self, row: &AlignedRow, params: &serde_json::Value) -> Result<Option<TemporalRecord>>;
}

impl<F> ComposeFn for F
where
    F: Fn(&AlignedRow, &serde_json::Value) -> Result<Option<TemporalRecord>> + Send + Sync,
{
    fn compose(&self, row: &AlignedRow, params: &serde_json::Value) -> Result<Option<TemporalRecord>> {
        self(row, params)
    }
}

/* ===================== built-in compose functions ===================== */

fn param<'a>(params: &'a serde_json::Value, name: &str, default: &'a str) -> &'a str {
    params.get(name).and_then(serde_json::Value::as_str).unwrap_or(default)
}

/// Reduce the numeric `field` (param, default `value`) of every input into `to`
/// (param, default `value`). Any null input yields a null output.
struct Reduce(fn(&[f64]) -> Option<f64>);

impl ComposeFn for Reduce {
    fn compose(&self, row: &AlignedRow, params: &serde_json::Value) -> Result<Option<TemporalRecord>> {
        let field = param(params, "field", "value");
        let to = param(params, "to", "value");
        let vals: Option<Vec<f64>> = row.values(field).collect();
        let out = vals.and_then(|v| (self.0)(&v));
        Ok(Some(row.template().with_field(to, Value::from(out))))
    }
}

/// `sum` compose function.
#[must_use]
pub fn sum() -> Arc<dyn ComposeFn> {
    Arc::new(Reduce(|v| Some(v.iter().sum())))
}

/// `mean` compose function.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean() -> Arc<dyn ComposeFn> {
    Arc::new(Reduce(|v| (!v.is_empty()).then(|| v.iter().sum::<f64>() / v.len() as f64)))
}

/// `difference` compose function: first input minus each following input.
#[must_use]
pub fn difference() -> Arc<dyn ComposeFn> {
    Arc::new(Reduce(|v| v.split_first().map(|(first, rest)| rest.iter().fold(*first, |acc, x| acc - x))))
}

/* ===================== aligner ===================== */

struct Cursor {
    alias: String,
    stream: RecordStream,
    head: Option<(RecordKey, TemporalRecord)>,
    last: Option<RecordKey>,
    exhausted: bool,
}

impl Cursor {
    fn load(&mut self, partition_by: &[String]) -> Result<()> {
        if self.head.is_some() || self.exhausted {
            return Ok(());
        }
        match self.stream.next() {
            Some(rec) => {
                let rec = rec.with_context(|| format!("compose input `{}`", self.alias))?;
                let key = (rec.partition_key(partition_by), rec.time);
                if let Some(last) = &self.last
                    && key <= *last
                {
                    let detail = if key == *last {
                        format!(
                            "input `{}` has duplicate records at partition `{}` time {}; collapse them with a granularity rule",
                            self.alias,
                            key.0,
                            format_timestamp(key.1)
                        )
                    } else {
                        format!("input `{}` went backwards to {key:?} after {last:?}", self.alias)
                    };
                    return Err(EngineError::ordering("compose", detail).into());
                }
                self.last = Some(key.clone());
                self.head = Some((key, rec));
            }
            None => self.exhausted = true,
        }
        Ok(())
    }
}

/// Iterator over the derived stream of a composed stream.
pub struct Aligner {
    stream_id: String,
    cursors: Vec<Cursor>,
    required: Vec<bool>,
    partition_by: Vec<String>,
    compose: Arc<dyn ComposeFn>,
    params: serde_json::Value,
    metrics: RunMetrics,
    done: bool,
}

impl Aligner {
    /// `inputs` pairs each alias with its regularized stream. `required` names
    /// the aliases that must be present for a row to compose; all when `None`.
    ///
    /// # Errors
    /// Fails when `required` names an unknown alias or no input is required.
    pub fn new(
        stream_id: impl Into<String>,
        inputs: Vec<(String, RecordStream)>,
        required: Option<&[String]>,
        partition_by: Vec<String>,
        compose: Arc<dyn ComposeFn>,
        params: serde_json::Value,
        metrics: RunMetrics,
    ) -> Result<Self> {
        let stream_id = stream_id.into();
        if let Some(req) = required
            && let Some(unknown) = req.iter().find(|r| !inputs.iter().any(|(a, _)| a == *r))
        {
            return Err(EngineError::config(
                format!("contracts.{stream_id}.required"),
                format!("`{unknown}` is not an input alias"),
            )
            .into());
        }
        let required: Vec<bool> = inputs
            .iter()
            .map(|(a, _)| required.is_none_or(|req| req.iter().any(|r| r == a)))
            .collect();
        if !required.iter().any(|r| *r) {
            bail!(EngineError::config(format!("contracts.{stream_id}.required"), "at least one input must be required"));
        }
        let cursors = inputs
            .into_iter()
            .map(|(alias, stream)| Cursor { alias, stream, head: None, last: None, exhausted: false })
            .collect();
        Ok(Self { stream_id, cursors, required, partition_by, compose, params, metrics, done: false })
    }

    fn step(&mut self) -> Result<Option<TemporalRecord>> {
        loop {
            for c in &mut self.cursors {
                c.load(&self.partition_by)?;
            }
            // A drained required input can never match again.
            if self.cursors.iter().zip(&self.required).any(|(c, req)| *req && c.head.is_none()) {
                return Ok(None);
            }
            let Some(min) = self.cursors.iter().filter_map(|c| c.head.as_ref().map(|(k, _)| k)).min().cloned()
            else {
                return Ok(None);
            };
            let mut inputs = Vec::with_capacity(self.cursors.len());
            let mut complete = true;
            for (c, req) in self.cursors.iter_mut().zip(&self.required) {
                let rec = if c.head.as_ref().is_some_and(|(k, _)| *k == min) {
                    c.head.take().map(|(_, r)| r)
                } else {
                    None
                };
                complete &= !*req || rec.is_some();
                inputs.push((c.alias.clone(), rec));
            }
            if !complete {
                self.metrics.increment(Counter::RowsUnmatched, 1);
                continue;
            }
            let row = AlignedRow { partition: min.0, time: min.1, inputs };
            let composed = self
                .compose
                .compose(&row, &self.params)
                .with_context(|| format!("compose `{}` at {}", self.stream_id, format_timestamp(row.time)))?;
            if let Some(rec) = composed {
                return Ok(Some(rec));
            }
        }
    }
}

impl Iterator for Aligner {
    type Item = Result<TemporalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
