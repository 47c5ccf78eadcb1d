//! Record rules: stateless, per-record filters and time shifts applied before ordering.

use crate::metrics::{Counter, RunMetrics};
use crate::record::{RecordStream, TemporalRecord, Value};
use crate::window::Cadence;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A record rule from a contract's `record` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordRule {
    /// Keep records whose field satisfies the comparison; others are dropped (and counted).
    Filter(FilterRule),
    /// Shift timestamps backwards by a fixed amount.
    Lag { by: Cadence },
    /// Floor timestamps to a resolution.
    FloorTime { resolution: Cadence },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    #[serde(alias = "==", alias = "equals")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    In,
    #[serde(alias = "nin", alias = "not in")]
    NotIn,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub op: FilterOp,
    /// Comparand for scalar operators.
    #[serde(default)]
    pub value: Option<Value>,
    /// Comparands for `in` / `not_in`.
    #[serde(default)]
    pub values: Option<Vec<Value>>,
}

impl FilterRule {
    /// Whether `rec` passes. A rule with no comparand passes everything.
    #[must_use]
    pub fn matches(&self, rec: &TemporalRecord) -> bool {
        let null = Value::Null;
        let left = rec
            .fields
            .get(&self.field)
            .or_else(|| rec.identity.get(&self.field))
            .unwrap_or(&null);
        match self.op {
            FilterOp::In | FilterOp::NotIn => {
                let bag = match (&self.values, &self.value) {
                    (Some(vs), _) => vs.as_slice(),
                    (None, Some(v)) => std::slice::from_ref(v),
                    (None, None) => return true,
                };
                let found = bag.iter().any(|c| scalar_eq(left, c));
                found == (self.op == FilterOp::In)
            }
            op => {
                let Some(comparand) = &self.value else {
                    return true;
                };
                let Some(ord) = left.compare(comparand) else {
                    return false;
                };
                match op {
                    FilterOp::Eq => ord == Ordering::Equal,
                    FilterOp::Ne => ord != Ordering::Equal,
                    FilterOp::Gt => ord == Ordering::Greater,
                    FilterOp::Ge => ord != Ordering::Less,
                    FilterOp::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                }
            }
        }
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    a.compare(b) == Some(Ordering::Equal)
}

impl RecordRule {
    /// Apply to one record; `None` means the record is dropped.
    #[must_use]
    pub fn apply(&self, mut rec: TemporalRecord) -> Option<TemporalRecord> {
        match self {
            Self::Filter(f) => f.matches(&rec).then_some(rec),
            Self::Lag { by } => {
                rec.time -= by.as_millis();
                Some(rec)
            }
            Self::FloorTime { resolution } => {
                rec.time = resolution.floor(rec.time);
                Some(rec)
            }
        }
    }
}

/// Apply record rules in declared order. Dropped records are counted, never errors.
pub fn apply_record_rules(stream: RecordStream, rules: &[RecordRule], metrics: &RunMetrics) -> RecordStream {
    if rules.is_empty() {
        return stream;
    }
    let rules = rules.to_vec();
    let metrics = metrics.clone();
    Box::new(stream.filter_map(move |item| match item {
        Ok(rec) => {
            let kept = rules.iter().try_fold(rec, |r, rule| rule.apply(r));
            if kept.is_none() {
                metrics.increment(Counter::RecordsFiltered, 1);
            }
            kept.map(Ok)
        }
        Err(e) => Some(Err(e)),
    }))
}
