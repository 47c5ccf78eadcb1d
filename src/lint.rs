//! Debug rules: read-only checks over a regularized stream.
//!
//! Lints never change the records they see. Violations are logged as
//! warnings, counted in [`RunMetrics`], and collected in a shared
//! [`LintCollector`] for later reporting. Only `identity_guard` with
//! `mode: error` can abort a run.

use crate::engine::{PartitionOp, PartitionStage};
use crate::metrics::{Counter, RunMetrics};
use crate::record::{RecordStream, TemporalRecord, Value};
use crate::window::{Cadence, TimestampMs, format_timestamp};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// A debug rule from a contract's `debug` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebugRule {
    /// Report gaps and off-grid steps between consecutive records.
    CadenceLint { tick: Cadence },
    /// Report identity fields that change within one partition.
    IdentityGuard {
        #[serde(default)]
        fields: Vec<String>,
        #[serde(default)]
        mode: LintMode,
    },
}

/// What a violation does to the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LintMode {
    #[default]
    Warn,
    Error,
}

/// A single lint finding with its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintViolation {
    pub rule: String,
    pub stream: String,
    pub partition: String,
    pub time: TimestampMs,
    pub message: String,
}

impl fmt::Display for LintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}/{} at {}: {}",
            self.rule,
            self.stream,
            if self.partition.is_empty() { "-" } else { &self.partition },
            format_timestamp(self.time),
            self.message
        )
    }
}

/// Collects lint violations across streams for batch reporting.
#[derive(Debug, Clone, Default)]
pub struct LintCollector {
    violations: Arc<Mutex<Vec<LintViolation>>>,
}

impl LintCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, v: LintViolation) {
        self.violations.lock().unwrap_or_else(PoisonError::into_inner).push(v);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.violations.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Snapshot of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<LintViolation> {
        self.violations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Export violations as pretty JSON.
    ///
    /// # Errors
    /// Fails if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.violations())?)
    }

    /// # Errors
    /// Fails if the file cannot be written.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

struct Reporter {
    rule: &'static str,
    stream: String,
    partition_by: Vec<String>,
    metrics: RunMetrics,
    collector: LintCollector,
}

impl Reporter {
    fn report(&self, rec: &TemporalRecord, message: String) {
        let v = LintViolation {
            rule: self.rule.to_string(),
            stream: self.stream.clone(),
            partition: rec.partition_key(&self.partition_by),
            time: rec.time,
            message,
        };
        warn!(target: "ironseries::lint", "{v}");
        self.metrics.increment(Counter::LintViolations, 1);
        self.collector.add(v);
    }
}

struct CadenceLintOp {
    step: i64,
    last: Option<TimestampMs>,
    reporter: Reporter,
}

impl PartitionOp for CadenceLintOp {
    fn push(&mut self, rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()> {
        if let Some(last) = self.last {
            let delta = rec.time - last;
            if delta > self.step && delta % self.step == 0 {
                self.reporter
                    .report(&rec, format!("gap of {} missing ticks", delta / self.step - 1));
            } else if delta != self.step {
                self.reporter
                    .report(&rec, format!("irregular step of {delta}ms, expected {}ms", self.step));
            }
        }
        self.last = Some(rec.time);
        out.push_back(rec);
        Ok(())
    }

    fn flush(&mut self, _out: &mut VecDeque<TemporalRecord>) {
        self.last = None;
    }
}

struct IdentityGuardOp {
    fields: Vec<String>,
    mode: LintMode,
    baseline: Option<BTreeMap<String, Value>>,
    reporter: Reporter,
}

impl IdentityGuardOp {
    fn identity_of(&self, rec: &TemporalRecord) -> BTreeMap<String, Value> {
        if self.fields.is_empty() {
            return rec.identity.clone();
        }
        self.fields
            .iter()
            .map(|f| {
                let v = rec.identity.get(f).or_else(|| rec.fields.get(f)).cloned().unwrap_or_default();
                (f.clone(), v)
            })
            .collect()
    }
}

impl PartitionOp for IdentityGuardOp {
    fn push(&mut self, rec: TemporalRecord, out: &mut VecDeque<TemporalRecord>) -> Result<()> {
        let current = self.identity_of(&rec);
        match &self.baseline {
            Some(base) if *base != current => {
                let changed: Vec<&str> = current
                    .iter()
                    .filter(|(k, v)| base.get(*k) != Some(*v))
                    .map(|(k, _)| k.as_str())
                    .collect();
                let message = format!("identity drifted within partition: {}", changed.join(", "));
                if self.mode == LintMode::Error {
                    bail!(
                        "identity_guard on `{}` at {}: {message}",
                        self.reporter.stream,
                        format_timestamp(rec.time)
                    );
                }
                self.reporter.report(&rec, message);
            }
            Some(_) => {}
            None => self.baseline = Some(current),
        }
        out.push_back(rec);
        Ok(())
    }

    fn flush(&mut self, _out: &mut VecDeque<TemporalRecord>) {
        self.baseline = None;
    }
}

/// Attach debug rules to a regularized stream.
pub fn apply_debug_rules(
    mut stream: RecordStream,
    stream_id: &str,
    partition_by: &[String],
    rules: &[DebugRule],
    metrics: &RunMetrics,
    collector: &LintCollector,
) -> RecordStream {
    for rule in rules {
        let (stage, op): (&'static str, Box<dyn PartitionOp>) = match rule {
            DebugRule::CadenceLint { tick } => (
                "cadence_lint",
                Box::new(CadenceLintOp {
                    step: tick.as_millis(),
                    last: None,
                    reporter: Reporter {
                        rule: "cadence_lint",
                        stream: stream_id.to_string(),
                        partition_by: partition_by.to_vec(),
                        metrics: metrics.clone(),
                        collector: collector.clone(),
                    },
                }),
            ),
            DebugRule::IdentityGuard { fields, mode } => (
                "identity_guard",
                Box::new(IdentityGuardOp {
                    fields: fields.clone(),
                    mode: *mode,
                    baseline: None,
                    reporter: Reporter {
                        rule: "identity_guard",
                        stream: stream_id.to_string(),
                        partition_by: partition_by.to_vec(),
                        metrics: metrics.clone(),
                        collector: collector.clone(),
                    },
                }),
            ),
        };
        stream = Box::new(PartitionStage::new(stream, partition_by.to_vec(), stage, op));
    }
    stream
}
