//! Feature projector.
//!
//! Turns a regularized record stream into [`FeatureEvent`]s for one configured
//! feature or target:
//!
//! 1. project: pick `field` from each record, suffix the id with the
//!    feature's own partition values and stamp the `group_by` bucket;
//! 2. re-order by `(feature_id, time)`;
//! 3. scale with cached or inline statistics;
//! 4. build sliding windows when `sequence` is set;
//! 5. re-order by `(bucket, feature_id, time)` for the assembler.
//!
//! Both re-orderings use the external sorter, so memory stays bounded.

use crate::artifacts::{ScalerEntry, ScalerStats};
use crate::error::EngineError;
use crate::ordering::{ExternalSorter, SortConfig};
use crate::record::{PARTITION_SEPARATOR, RecordStream, TemporalRecord, Value};
use crate::window::{Cadence, TimestampMs};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Field name carried by the records inside a sequence window.
pub const VALUE_FIELD: &str = "value";

/// A pull-based stream of feature events.
pub type EventStream = Box<dyn Iterator<Item = Result<FeatureEvent>> + Send>;

fn default_field() -> String {
    VALUE_FIELD.to_string()
}

/* ===================== configuration ===================== */

/// One feature or target of the dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    #[serde(alias = "feature_id")]
    pub id: String,
    /// Canonical stream id the values come from.
    #[serde(alias = "record_stream")]
    pub stream: String,
    #[serde(default = "default_field")]
    pub field: String,
    /// Identity fields appended to the id, e.g. `temp__oslo`.
    #[serde(default)]
    pub partition_by: Vec<String>,
    #[serde(default)]
    pub scale: Option<ScaleSpec>,
    #[serde(default)]
    pub sequence: Option<SequenceSpec>,
}

impl FeatureSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream: stream.into(),
            field: default_field(),
            partition_by: Vec::new(),
            scale: None,
            sequence: None,
        }
    }

    /// Scaling options when scaling is enabled.
    #[must_use]
    pub fn scaling(&self) -> Option<ScaleOptions> {
        match &self.scale {
            Some(ScaleSpec::Flag(true)) => Some(ScaleOptions::default()),
            Some(ScaleSpec::Options(o)) => Some(o.clone()),
            Some(ScaleSpec::Flag(false)) | None => None,
        }
    }

    /// Full feature id of a record: base id plus partition suffix.
    #[must_use]
    pub fn feature_id(&self, rec: &TemporalRecord) -> String {
        if self.partition_by.is_empty() {
            return self.id.clone();
        }
        format!("{}{PARTITION_SEPARATOR}{}", self.id, rec.partition_key(&self.partition_by))
    }
}

/// `scale: true` or `scale: { ... }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleSpec {
    Flag(bool),
    Options(ScaleOptions),
}

const fn yes() -> bool {
    true
}

const fn default_epsilon() -> f64 {
    1e-12
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleOptions {
    #[serde(default = "yes")]
    pub with_mean: bool,
    #[serde(default = "yes")]
    pub with_std: bool,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Inline statistics; when both are given no scaler artifact is needed.
    #[serde(default)]
    pub mean: Option<f64>,
    #[serde(default)]
    pub std: Option<f64>,
}

impl Default for ScaleOptions {
    fn default() -> Self {
        Self { with_mean: true, with_std: true, epsilon: default_epsilon(), mean: None, std: None }
    }
}

impl ScaleOptions {
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        self.mean.is_some() && self.std.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub size: usize,
    #[serde(default = "one")]
    pub stride: usize,
    /// When set, a window is only emitted if its records are exactly this far apart.
    #[serde(default)]
    pub cadence: Option<Cadence>,
}

const fn one() -> usize {
    1
}

/* ===================== events ===================== */

/// A sliding window of records for one feature id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceWindow {
    pub size: usize,
    pub stride: usize,
    pub cadence: Option<Cadence>,
    pub records: Vec<TemporalRecord>,
}

impl SequenceWindow {
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.records.iter().map(|r| r.field(VALUE_FIELD).clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Scalar(Value),
    Window(SequenceWindow),
}

/// One value of one feature id, stamped with its assembly bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureEvent {
    pub feature_id: String,
    pub time: TimestampMs,
    pub bucket: TimestampMs,
    pub payload: EventPayload,
}

/* ===================== scaling ===================== */

struct Scaling {
    options: ScaleOptions,
    stats: BTreeMap<String, ScalerEntry>,
}

impl Scaling {
    fn resolve(&self, feature_id: &str) -> Result<(f64, f64)> {
        let (mean, std) = match (self.options.mean, self.options.std) {
            (Some(m), Some(s)) => (m, s),
            _ => {
                let entry = self.stats.get(feature_id).ok_or_else(|| {
                    EngineError::MissingArtifact(format!("scaler statistics for `{feature_id}`"))
                })?;
                (self.options.mean.unwrap_or(entry.mean), self.options.std.unwrap_or(entry.std))
            }
        };
        let mean = if self.options.with_mean { mean } else { 0.0 };
        let std = if self.options.with_std { std.max(self.options.epsilon) } else { 1.0 };
        Ok((mean, std))
    }

    fn apply(&self, mut ev: FeatureEvent) -> Result<FeatureEvent> {
        let (mean, std) = self.resolve(&ev.feature_id)?;
        if let EventPayload::Scalar(v) = &mut ev.payload
            && let Some(x) = v.as_f64()
        {
            *v = Value::Number((x - mean) / std);
        }
        Ok(ev)
    }
}

/* ===================== sequencing ===================== */

struct Sequencer<I> {
    inner: I,
    spec: SequenceSpec,
    current: Option<String>,
    window: VecDeque<FeatureEvent>,
    step: usize,
}

impl<I> Sequencer<I> {
    fn reset(&mut self, feature_id: Option<String>) {
        self.current = feature_id;
        self.window.clear();
        self.step = 0;
    }

    fn push(&mut self, ev: FeatureEvent) -> Option<FeatureEvent> {
        if self.current.as_deref() != Some(ev.feature_id.as_str()) {
            self.reset(Some(ev.feature_id.clone()));
        }
        let irregular = match (self.spec.cadence, self.window.back()) {
            (Some(cadence), Some(last)) => ev.time - last.time != cadence.as_millis(),
            _ => false,
        };
        if irregular {
            // An irregular step restarts the window.
            self.reset(Some(ev.feature_id.clone()));
        }
        if self.window.len() == self.spec.size {
            self.window.pop_front();
        }
        self.window.push_back(ev);
        let emit = self.window.len() == self.spec.size && self.step % self.spec.stride == 0;
        self.step += 1;
        if !emit {
            return None;
        }
        let last = self.window.back()?;
        let records = self
            .window
            .iter()
            .map(|e| {
                let v = match &e.payload {
                    EventPayload::Scalar(v) => v.clone(),
                    EventPayload::Window(_) => Value::Null,
                };
                TemporalRecord::new(e.time).with_field(VALUE_FIELD, v)
            })
            .collect();
        Some(FeatureEvent {
            feature_id: last.feature_id.clone(),
            time: last.time,
            bucket: last.bucket,
            payload: EventPayload::Window(SequenceWindow {
                size: self.spec.size,
                stride: self.spec.stride,
                cadence: self.spec.cadence,
                records,
            }),
        })
    }
}

impl<I: Iterator<Item = Result<FeatureEvent>>> Iterator for Sequencer<I> {
    type Item = Result<FeatureEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(ev) => {
                    if let Some(out) = self.push(ev) {
                        return Some(Ok(out));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/* ===================== projector ===================== */

/// Builds the event stream of one feature or target.
pub struct FeatureProjector {
    spec: FeatureSpec,
    group_by: Cadence,
    scaling: Option<Scaling>,
    sort: SortConfig,
}

impl FeatureProjector {
    /// # Errors
    /// Scaling without inline statistics and without a scaler artifact is a
    /// [`EngineError::MissingArtifact`].
    pub fn new(spec: FeatureSpec, group_by: Cadence, scaler: Option<&ScalerStats>, sort: SortConfig) -> Result<Self> {
        let scaling = match spec.scaling() {
            None => None,
            Some(options) if options.is_inline() => Some(Scaling { options, stats: BTreeMap::new() }),
            Some(options) => {
                let stats = scaler.ok_or_else(|| EngineError::MissingArtifact("scaler".to_string()))?;
                let prefix = format!("{}{PARTITION_SEPARATOR}", spec.id);
                let stats = stats
                    .statistics
                    .iter()
                    .filter(|(id, _)| **id == spec.id || id.starts_with(&prefix))
                    .map(|(id, e)| (id.clone(), e.clone()))
                    .collect();
                Some(Scaling { options, stats })
            }
        };
        Ok(Self { spec, group_by, scaling, sort })
    }

    #[must_use]
    pub const fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    /// Full event pipeline over `records`, ordered by `(bucket, feature_id, time)`.
    pub fn project(self, records: RecordStream) -> EventStream {
        let Self { spec, group_by, scaling, sort } = self;
        let field = spec.field.clone();
        let id_spec = spec.clone();
        let events = records.map(move |r| {
            r.map(|rec| FeatureEvent {
                feature_id: id_spec.feature_id(&rec),
                time: rec.time,
                bucket: group_by.floor(rec.time),
                payload: EventPayload::Scalar(rec.field(&field).clone()),
            })
        });
        let by_feature = ExternalSorter::new(
            events,
            |e: &FeatureEvent| (e.feature_id.clone(), e.time),
            sort.clone(),
        );
        let mut stream: EventStream = Box::new(by_feature);
        if let Some(scaling) = scaling {
            stream = Box::new(stream.map(move |ev| ev.and_then(|ev| scaling.apply(ev))));
        }
        if let Some(seq) = spec.sequence {
            stream = Box::new(Sequencer { inner: stream, spec: seq, current: None, window: VecDeque::new(), step: 0 });
        }
        Box::new(ExternalSorter::new(
            stream,
            |e: &FeatureEvent| (e.bucket, e.feature_id.clone(), e.time),
            sort,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::boxed;

    fn hourly(values: &[Option<f64>]) -> RecordStream {
        let recs: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| Ok(TemporalRecord::new(i as i64 * 3_600_000).with_field("value", *v)))
            .collect();
        boxed(recs.into_iter())
    }

    #[test]
    fn sequence_respects_stride() {
        let mut spec = FeatureSpec::new("x", "s");
        spec.sequence = Some(SequenceSpec { size: 2, stride: 2, cadence: None });
        let p = FeatureProjector::new(spec, Cadence::HOUR, None, SortConfig::default()).unwrap();
        let out: Vec<_> = p.project(hourly(&[Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0)])).collect::<Result<_>>().unwrap();
        // Full windows at steps 1..=4; stride keeps steps 2 and 4.
        let ends: Vec<_> = out.iter().map(|e| e.time / 3_600_000).collect();
        assert_eq!(ends, vec![2, 4]);
    }

    #[test]
    fn scaling_without_stats_is_missing_artifact() {
        let mut spec = FeatureSpec::new("x", "s");
        spec.scale = Some(ScaleSpec::Flag(true));
        let err = FeatureProjector::new(spec, Cadence::HOUR, None, SortConfig::default()).err().unwrap();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::MissingArtifact(_))));
    }
}
