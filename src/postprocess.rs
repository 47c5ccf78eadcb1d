//! Postprocess and schema enforcement.
//!
//! Every sample is first normalized against the [`SchemaArtifact`]: ids
//! outside the schema are removed, missing ids become explicit nulls and
//! sequence ids are padded or truncated to their cadence target. Configured
//! [`VectorTransform`]s then run in declared order, each on the payload it
//! names.
//!
//! ```
//! use ironseries::postprocess::VectorTransform;
//!
//! let ts: Vec<VectorTransform> = serde_json::from_str(r#"[
//!     {"kind": "drop", "axis": "horizontal", "threshold": 0.5},
//!     {"kind": "fill", "statistic": "mean", "window": 24, "payload": "targets"},
//!     {"kind": "replace", "value": 0}
//! ]"#)?;
//! assert_eq!(ts.len(), 3);
//! # anyhow::Ok(())
//! ```

use crate::artifacts::{EntryKind, SchemaArtifact, VectorMetadata, base_id};
use crate::combiners::Statistic;
use crate::error::EngineError;
use crate::metrics::{Counter, RunMetrics};
use crate::record::Value;
use crate::sample::{FeatureValue, Payload, Sample, SampleStream};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, info};

const fn one() -> usize {
    1
}

const fn full_coverage() -> f64 {
    1.0
}

const fn median_statistic() -> Statistic {
    Statistic::Median
}

/// A vector-level transform from the `postprocess` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VectorTransform {
    /// Remove samples (horizontal) or ids (vertical) below a coverage threshold.
    Drop(DropRule),
    /// Remove samples lacking required ids or below a coverage ratio.
    DropMissing(DropMissing),
    /// Impute from a trailing window of prior samples.
    Fill(HistoryFill),
    /// Impute a partition column from its sibling partitions in the same sample.
    FillAcrossPartitions(PartitionFill),
    /// Seed remaining missing values with a literal.
    Replace(Replace),
}

impl VectorTransform {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Drop(_) => "drop",
            Self::DropMissing(_) => "drop_missing",
            Self::Fill(_) => "fill",
            Self::FillAcrossPartitions(_) => "fill_across_partitions",
            Self::Replace(_) => "replace",
        }
    }

    #[must_use]
    pub const fn payload(&self) -> Payload {
        match self {
            Self::Drop(r) => r.payload,
            Self::DropMissing(r) => r.payload,
            Self::Fill(r) => r.payload,
            Self::FillAcrossPartitions(r) => r.payload,
            Self::Replace(r) => r.payload,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropRule {
    #[serde(default)]
    pub axis: Axis,
    pub threshold: f64,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropMissing {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default = "full_coverage")]
    pub min_coverage: f64,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryFill {
    #[serde(default = "median_statistic")]
    pub statistic: Statistic,
    /// Prior values kept per id; unbounded when absent.
    #[serde(default)]
    pub window: Option<usize>,
    #[serde(default = "one")]
    pub min_samples: usize,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionFill {
    #[serde(default = "median_statistic")]
    pub statistic: Statistic,
    #[serde(default = "one")]
    pub min_samples: usize,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Replace {
    pub value: Value,
    #[serde(default)]
    pub payload: Payload,
}

/* ===================== compiled transforms ===================== */

enum Step {
    Horizontal { threshold: f64 },
    Prune { ids: BTreeSet<String> },
    DropMissing { required: Vec<String>, min_coverage: f64 },
    Fill { statistic: Statistic, window: Option<usize>, min_samples: usize, history: HashMap<String, VecDeque<f64>> },
    AcrossPartitions { statistic: Statistic, min_samples: usize },
    Replace { value: Value },
}

struct Stage {
    name: &'static str,
    payload: Payload,
    /// Expected ids at this point of the chain.
    expected: Vec<String>,
    step: Step,
}

fn expected_kind(schema: &SchemaArtifact, payload: Payload) -> BTreeMap<String, (EntryKind, usize)> {
    schema
        .entries(payload)
        .iter()
        .map(|e| (e.id.clone(), (e.kind, e.cadence.as_ref().map_or(0, |c| c.target))))
        .collect()
}

/// Applies schema normalization and the vector transform chain to samples.
pub struct Postprocessor {
    layout: [BTreeMap<String, (EntryKind, usize)>; 2],
    stages: Vec<Stage>,
    metrics: RunMetrics,
}

const fn slot(payload: Payload) -> usize {
    match payload {
        Payload::Features => 0,
        Payload::Targets => 1,
    }
}

impl Postprocessor {
    /// Compile the chain. Vertical drops are resolved once, here, from
    /// `metadata`.
    ///
    /// # Errors
    /// A vertical drop without metadata is [`EngineError::MissingArtifact`].
    pub fn new(
        schema: &SchemaArtifact,
        metadata: Option<&VectorMetadata>,
        transforms: &[VectorTransform],
        metrics: RunMetrics,
    ) -> Result<Self> {
        let layout = [expected_kind(schema, Payload::Features), expected_kind(schema, Payload::Targets)];
        let mut active = [schema.ids(Payload::Features), schema.ids(Payload::Targets)];
        let mut stages = Vec::with_capacity(transforms.len());
        for t in transforms {
            let payload = t.payload();
            let step = match t {
                VectorTransform::Drop(DropRule { axis: Axis::Horizontal, threshold, .. }) => {
                    Step::Horizontal { threshold: *threshold }
                }
                VectorTransform::Drop(DropRule { axis: Axis::Vertical, threshold, .. }) => {
                    let meta = metadata.ok_or_else(|| EngineError::MissingArtifact("metadata".to_string()))?;
                    let coverage: HashMap<&str, f64> =
                        meta.entries(payload).iter().map(|e| (e.id.as_str(), e.coverage)).collect();
                    let ids: BTreeSet<String> = active[slot(payload)]
                        .iter()
                        .filter(|id| coverage.get(id.as_str()).copied().unwrap_or(0.0) < *threshold)
                        .cloned()
                        .collect();
                    if !ids.is_empty() {
                        info!(pruned = ids.len(), threshold, "vertical drop pruned weak columns");
                    }
                    active[slot(payload)].retain(|id| !ids.contains(id));
                    Step::Prune { ids }
                }
                VectorTransform::DropMissing(r) => {
                    Step::DropMissing { required: r.required.clone(), min_coverage: r.min_coverage }
                }
                VectorTransform::Fill(r) => Step::Fill {
                    statistic: r.statistic,
                    window: r.window,
                    min_samples: r.min_samples,
                    history: HashMap::new(),
                },
                VectorTransform::FillAcrossPartitions(r) => {
                    Step::AcrossPartitions { statistic: r.statistic, min_samples: r.min_samples }
                }
                VectorTransform::Replace(r) => Step::Replace { value: r.value.clone() },
            };
            stages.push(Stage { name: t.name(), payload, expected: active[slot(payload)].clone(), step });
        }
        debug!(stages = stages.len(), "postprocess chain compiled");
        Ok(Self { layout, stages, metrics })
    }

    /// Conform a sample to the schema layout.
    pub fn normalize(&self, sample: &mut Sample) {
        for payload in [Payload::Features, Payload::Targets] {
            let layout = &self.layout[slot(payload)];
            let map = sample.payload_mut(payload);
            let mut raw = std::mem::take(map);
            for (id, (kind, target)) in layout {
                let value = raw.remove(id);
                let conformed = match kind {
                    EntryKind::Scalar => value.unwrap_or(FeatureValue::Scalar(Value::Null)),
                    EntryKind::Sequence => {
                        let mut cells = match value {
                            Some(FeatureValue::Sequence(vs)) => vs,
                            Some(FeatureValue::Scalar(v)) => vec![v],
                            None => Vec::new(),
                        };
                        cells.resize(*target, Value::Null);
                        FeatureValue::Sequence(cells)
                    }
                };
                map.insert(id.clone(), conformed);
            }
        }
    }

    /// Run the chain on one sample; `None` when a transform dropped it.
    ///
    /// # Errors
    /// Reserved for transforms that can fail; the built-in ones do not.
    pub fn process(&mut self, mut sample: Sample) -> Result<Option<Sample>> {
        self.normalize(&mut sample);
        for stage in &mut self.stages {
            if !stage.apply(&mut sample) {
                debug!(transform = stage.name, key = sample.key, "sample dropped");
                self.metrics.increment(Counter::SamplesDropped, 1);
                return Ok(None);
            }
        }
        Ok(Some(sample))
    }

    /// Apply to a stream of samples.
    pub fn apply(mut self, samples: SampleStream) -> SampleStream {
        Box::new(samples.filter_map(move |s| match s {
            Ok(s) => self.process(s).transpose(),
            Err(e) => Some(Err(e)),
        }))
    }
}

impl Stage {
    /// Returns false when the sample is dropped.
    fn apply(&mut self, sample: &mut Sample) -> bool {
        let expected = &self.expected;
        let map = sample.payload_mut(self.payload);
        match &mut self.step {
            Step::Horizontal { threshold } => {
                if expected.is_empty() {
                    return true;
                }
                #[allow(clippy::cast_precision_loss)]
                let coverage = expected.iter().map(|id| map.get(id).map_or(0.0, FeatureValue::coverage)).sum::<f64>()
                    / expected.len() as f64;
                coverage >= *threshold
            }
            Step::Prune { ids } => {
                map.retain(|id, _| !ids.contains(id));
                true
            }
            Step::DropMissing { required, min_coverage } => {
                let present = |id: &String| map.get(id).is_some_and(|v| !v.is_missing());
                if !required.iter().all(present) {
                    return false;
                }
                if expected.is_empty() {
                    return true;
                }
                #[allow(clippy::cast_precision_loss)]
                let coverage = expected.iter().filter(|id| present(id)).count() as f64 / expected.len() as f64;
                coverage >= *min_coverage
            }
            Step::Fill { statistic, window, min_samples, history } => {
                for id in expected {
                    let missing = map.get(id).is_none_or(|v| matches!(v, FeatureValue::Scalar(Value::Null)));
                    if !missing {
                        continue;
                    }
                    let Some(h) = history.get(id) else {
                        continue;
                    };
                    if h.len() >= *min_samples
                        && let Some(fill) = statistic.reduce(h.iter().copied())
                    {
                        map.insert(id.clone(), FeatureValue::from(fill));
                    }
                }
                for (id, v) in map.iter() {
                    let Some(x) = v.as_f64() else {
                        continue;
                    };
                    let h = history.entry(id.clone()).or_default();
                    h.push_back(x);
                    if window.is_some_and(|w| h.len() > w) {
                        h.pop_front();
                    }
                }
                true
            }
            Step::AcrossPartitions { statistic, min_samples } => {
                let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
                for (id, v) in map.iter() {
                    if let Some(x) = v.as_f64() {
                        groups.entry(base_id(id).to_string()).or_default().push(x);
                    }
                }
                for id in expected {
                    if map.get(id).is_some_and(|v| !v.is_missing()) {
                        continue;
                    }
                    let Some(candidates) = groups.get(base_id(id)) else {
                        continue;
                    };
                    if candidates.len() >= *min_samples
                        && let Some(fill) = statistic.reduce(candidates.iter().copied())
                    {
                        map.insert(id.clone(), FeatureValue::from(fill));
                    }
                }
                true
            }
            Step::Replace { value } => {
                for id in expected {
                    match map.get_mut(id) {
                        Some(FeatureValue::Sequence(cells)) => {
                            for c in cells.iter_mut().filter(|c| c.is_null()) {
                                *c = value.clone();
                            }
                        }
                        Some(FeatureValue::Scalar(v)) if v.is_null() => *v = value.clone(),
                        Some(FeatureValue::Scalar(_)) => {}
                        None => {
                            map.insert(id.clone(), FeatureValue::Scalar(value.clone()));
                        }
                    }
                }
                true
            }
        }
    }
}

/// Build a postprocessor, or fail when transforms exist but no schema was built.
///
/// # Errors
/// [`EngineError::MissingArtifact`] without a schema.
pub fn postprocessor(
    schema: Option<&SchemaArtifact>,
    metadata: Option<&VectorMetadata>,
    transforms: &[VectorTransform],
    metrics: RunMetrics,
) -> Result<Postprocessor> {
    let schema = schema.ok_or_else(|| EngineError::MissingArtifact("schema".to_string()))?;
    Postprocessor::new(schema, metadata, transforms, metrics)
}
