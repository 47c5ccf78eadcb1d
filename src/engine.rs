//! Partition window engine.
//!
//! Stream rules run over a record stream that is already ordered by
//! `(partition key, time)`. Each rule is a [`PartitionOp`] whose state is
//! scoped to the current partition: when the partition key changes the op is
//! flushed and reset, so memory is bounded by one open window per rule.
//!
//! [`PartitionStage`] drives an op and re-checks the ordering it relies on;
//! a key that moves backwards is an [`EngineError::Ordering`].
//!
//! ```
//! use ironseries::engine::{StreamRule, apply_stream_rules};
//! use ironseries::metrics::RunMetrics;
//! use ironseries::record::{TemporalRecord, boxed};
//!
//! let hour = 3_600_000;
//! let input = vec![
//!     Ok(TemporalRecord::new(0).with_field("value", 1.0)),
//!     Ok(TemporalRecord::new(3 * hour).with_field("value", 4.0)),
//! ];
//! let rules: Vec<StreamRule> = serde_json::from_str(r#"[{"kind": "ensure_cadence", "tick": "1h"}]"#)?;
//! let out: Vec<_> = apply_stream_rules(boxed(input.into_iter()), &[], &rules, &RunMetrics::new())
//!     .collect::<anyhow::Result<_>>()?;
//! assert_eq!(out.len(), 4);
//! assert!(out[1].field("value").is_null());
//! # anyhow::Ok(())
//! ```

use crate::combiners::Statistic;
use crate::error::EngineError;
use crate::metrics::{Counter, RunMetrics};
use crate::record::{RecordStream, TemporalRecord, Value};
use crate::window::{Cadence, TimestampMs};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

fn default_field() -> String {
    "value".to_string()
}

const fn default_min_samples() -> usize {
    1
}

/* ===================== rule configuration ===================== */

/// A stateful per-partition stream rule, as written in a contract's `stream` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamRule {
    /// Insert null placeholders so consecutive records are exactly one tick apart.
    EnsureCadence(EnsureCadence),
    /// Drop consecutive records identical in time, identity and fields.
    Dedupe,
    /// Collapse records sharing a timestamp.
    Granularity(Granularity),
    /// Impute nulls from recent non-null history.
    Fill(FillRule),
    /// Replace a field by its rolling statistic.
    Rolling(Rolling),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsureCadence {
    pub tick: Cadence,
    /// Only this field is carried (as null) on placeholders; all fields when absent.
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Granularity {
    #[serde(default = "first_statistic")]
    pub mode: Statistic,
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(default)]
    pub to: Option<String>,
}

const fn first_statistic() -> Statistic {
    Statistic::First
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FillRule {
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(default = "median_statistic")]
    pub statistic: Statistic,
    /// Number of most recent non-null values kept; unbounded when absent.
    #[serde(default)]
    pub window: Option<usize>,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

const fn median_statistic() -> Statistic {
    Statistic::Median
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rolling {
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default = "mean_statistic")]
    pub statistic: Statistic,
    /// Trailing ticks considered, nulls included.
    pub window: usize,
    /// Non-null values required to emit; defaults to `window`.
    #[serde(default)]
    pub min_samples: Option<usize>,
}

const fn mean_statistic() -> Statistic {
    Statistic::Mean
}

/* ===================== partition driver ===================== */

/// Per-partition stateful operator.
pub trait PartitionOp: Send {
    /// Feed the next record of the current partition.
    ///
    /// # Errors
    /// Implementations may reject a record fatally.
    fn push(&mut self, rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()>;

    /// Partition boundary or end of stream: emit held records and reset.
    fn flush(&mut self, _out: &mut VecDeque<TemporalRecord>) {}
}

/// Drives one [`PartitionOp`] over an ordered stream.
pub struct PartitionStage {
    inner: Option<RecordStream>,
    op: Box<dyn PartitionOp>,
    partition_by: Vec<String>,
    current: Option<(String, TimestampMs)>,
    out: VecDeque<TemporalRecord>,
    stage: &'static str,
}

impl PartitionStage {
    pub fn new(inner: RecordStream, partition_by: Vec<String>, stage: &'static str, op: Box<dyn PartitionOp>) -> Self {
        Self { inner: Some(inner), op, partition_by, current: None, out: VecDeque::new(), stage }
    }

    fn accept(&mut self, rec: TemporalRecord) -> Result<()> {
        let key = rec.partition_key(&self.partition_by);
        match &self.current {
            Some((cur, last)) if *cur == key => {
                if rec.time < *last {
                    return Err(EngineError::ordering(
                        self.stage,
                        format!("partition `{key}` went back in time from {last} to {}", rec.time),
                    )
                    .into());
                }
            }
            Some((cur, _)) => {
                if key < *cur {
                    return Err(EngineError::ordering(
                        self.stage,
                        format!("partition `{key}` arrived after partition `{cur}`"),
                    )
                    .into());
                }
                self.op.flush(&mut self.out);
            }
            None => {}
        }
        self.current = Some((key, rec.time));
        self.op.push(rec, &mut self.out)
    }
}

impl Iterator for PartitionStage {
    type Item = Result<TemporalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rec) = self.out.pop_front() {
                return Some(Ok(rec));
            }
            let inner = self.inner.as_mut()?;
            match inner.next() {
                Some(Ok(rec)) => {
                    if let Err(e) = self.accept(rec) {
                        self.inner = None;
                        self.out.clear();
                        return Some(Err(e));
                    }
                }
                Some(Err(e)) => {
                    self.inner = None;
                    self.out.clear();
                    return Some(Err(e));
                }
                None => {
                    self.inner = None;
                    self.op.flush(&mut self.out);
                }
            }
        }
    }
}

/* ===================== ops ===================== */

struct EnsureCadenceOp {
    step: i64,
    field: Option<String>,
    last: Option<TemporalRecord>,
    metrics: RunMetrics,
}

impl PartitionOp for EnsureCadenceOp {
    fn push(&mut self, rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()> {
        if let Some(last) = &self.last {
            let mut expect = last.time + self.step;
            let mut inserted = 0u64;
            while expect < rec.time {
                let placeholder = match &self.field {
                    Some(f) => {
                        let mut p = TemporalRecord::new(expect);
                        p.identity.clone_from(&rec.identity);
                        p.set_field(f.clone(), Value::Null);
                        p
                    }
                    None => rec.nulled_at(expect),
                };
                out.push_back(placeholder);
                expect += self.step;
                inserted += 1;
            }
            self.metrics.increment(Counter::TicksInserted, inserted);
        }
        self.last = Some(rec.clone());
        out.push_back(rec);
        Ok(())
    }

    fn flush(&mut self, _out: &mut VecDeque<TemporalRecord>) {
        self.last = None;
    }
}

struct DedupeOp {
    last: Option<TemporalRecord>,
    metrics: RunMetrics,
}

impl PartitionOp for DedupeOp {
    fn push(&mut self, rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()> {
        if self.last.as_ref() == Some(&rec) {
            self.metrics.increment(Counter::DuplicatesDropped, 1);
            return Ok(());
        }
        self.last = Some(rec.clone());
        out.push_back(rec);
        Ok(())
    }

    fn flush(&mut self, _out: &mut VecDeque<TemporalRecord>) {
        self.last = None;
    }
}

struct GranularityOp {
    rule: Granularity,
    bucket: Vec<TemporalRecord>,
    metrics: RunMetrics,
}

impl GranularityOp {
    fn emit(&mut self, out: &mut VecDeque<TemporalRecord>) {
        let bucket = std::mem::take(&mut self.bucket);
        let merged = bucket.len().saturating_sub(1) as u64;
        let to = self.rule.to.clone().unwrap_or_else(|| self.rule.field.clone());
        let picked = match self.rule.mode {
            Statistic::First => bucket.into_iter().next().map(|r| {
                let v = r.field(&self.rule.field).clone();
                (r, v)
            }),
            Statistic::Last => bucket.into_iter().next_back().map(|r| {
                let v = r.field(&self.rule.field).clone();
                (r, v)
            }),
            stat @ (Statistic::Mean | Statistic::Median) => {
                let v = Value::from(stat.reduce(bucket.iter().filter_map(|r| r.numeric(&self.rule.field))));
                bucket.into_iter().next_back().map(|r| (r, v))
            }
        };
        if let Some((mut rec, v)) = picked {
            rec.set_field(to, v);
            out.push_back(rec);
        }
        self.metrics.increment(Counter::RecordsAggregated, merged);
    }
}

impl PartitionOp for GranularityOp {
    fn push(&mut self, rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()> {
        if self.bucket.first().is_some_and(|b| b.time != rec.time) {
            self.emit(out);
        }
        self.bucket.push(rec);
        Ok(())
    }

    fn flush(&mut self, out: &mut VecDeque<TemporalRecord>) {
        if !self.bucket.is_empty() {
            self.emit(out);
        }
    }
}

struct FillOp {
    rule: FillRule,
    history: VecDeque<f64>,
    metrics: RunMetrics,
}

impl PartitionOp for FillOp {
    fn push(&mut self, mut rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()> {
        match rec.numeric(&self.rule.field) {
            Some(v) => {
                self.history.push_back(v);
                if let Some(w) = self.rule.window
                    && self.history.len() > w
                {
                    self.history.pop_front();
                }
            }
            None if rec.field(&self.rule.field).is_null() && self.history.len() >= self.rule.min_samples => {
                if let Some(fill) = self.rule.statistic.reduce(self.history.iter().copied()) {
                    rec.set_field(self.rule.field.clone(), fill);
                    self.metrics.increment(Counter::ValuesFilled, 1);
                }
            }
            None => {}
        }
        out.push_back(rec);
        Ok(())
    }

    fn flush(&mut self, _out: &mut VecDeque<TemporalRecord>) {
        self.history.clear();
    }
}

struct RollingOp {
    rule: Rolling,
    ticks: VecDeque<Option<f64>>,
}

impl PartitionOp for RollingOp {
    fn push(&mut self, mut rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()> {
        if self.ticks.len() == self.rule.window {
            self.ticks.pop_front();
        }
        self.ticks.push_back(rec.numeric(&self.rule.field));
        let min_samples = self.rule.min_samples.unwrap_or(self.rule.window);
        let valid = self.ticks.iter().flatten().count();
        let rolled = if valid >= min_samples {
            self.rule.statistic.reduce(self.ticks.iter().flatten().copied())
        } else {
            None
        };
        let to = self.rule.to.clone().unwrap_or_else(|| self.rule.field.clone());
        rec.set_field(to, rolled);
        out.push_back(rec);
        Ok(())
    }

    fn flush(&mut self, _out: &mut VecDeque<TemporalRecord>) {
        self.ticks.clear();
    }
}

impl StreamRule {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EnsureCadence(_) => "ensure_cadence",
            Self::Dedupe => "dedupe",
            Self::Granularity(_) => "granularity",
            Self::Fill(_) => "fill",
            Self::Rolling(_) => "rolling",
        }
    }

    fn into_op(self, metrics: &RunMetrics) -> Box<dyn PartitionOp> {
        let metrics = metrics.clone();
        match self {
            Self::EnsureCadence(r) => Box::new(EnsureCadenceOp {
                step: r.tick.as_millis(),
                field: r.field,
                last: None,
                metrics,
            }),
            Self::Dedupe => Box::new(DedupeOp { last: None, metrics }),
            Self::Granularity(rule) => Box::new(GranularityOp { rule, bucket: Vec::new(), metrics }),
            Self::Fill(rule) => Box::new(FillOp { rule, history: VecDeque::new(), metrics }),
            Self::Rolling(rule) => Box::new(RollingOp { rule, ticks: VecDeque::new() }),
        }
    }
}

/// Chain stream rules, in declared order, over an ordered stream.
pub fn apply_stream_rules(
    mut stream: RecordStream,
    partition_by: &[String],
    rules: &[StreamRule],
    metrics: &RunMetrics,
) -> RecordStream {
    for rule in rules {
        debug!(rule = rule.name(), "stream rule attached");
        let stage = rule.name();
        stream = Box::new(PartitionStage::new(stream, partition_by.to_vec(), stage, rule.clone().into_op(metrics)));
    }
    stream
}
