//! Derived artifacts: vector schema, vector metadata and scaler statistics.
//!
//! Artifacts are computed by profiling a pass of assembled samples and stored
//! as pretty JSON under an [`ArtifactStore`] root. They are consumed read-only:
//! the schema by postprocess, metadata by vertical drops and rectangular
//! assembly, scaler statistics by feature scaling.

use crate::combiners::RunningStats;
use crate::error::EngineError;
use crate::record::{PARTITION_SEPARATOR, Value};
use crate::sample::{FeatureValue, Payload, Sample};
use crate::window::{Cadence, TimestampMs, Window, format_timestamp, parse_timestamp};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The three cached artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Schema,
    Metadata,
    Scaler,
}

impl ArtifactKind {
    pub const ALL: [Self; 3] = [Self::Schema, Self::Metadata, Self::Scaler];

    /// Key in the build state and stem of the lock file.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Metadata => "metadata",
            Self::Scaler => "scaler",
        }
    }

    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Schema => "schema.json",
            Self::Metadata => "metadata.json",
            Self::Scaler => "scaler.json",
        }
    }

    /// Bumped whenever the artifact layout changes; part of the cache key.
    #[must_use]
    pub const fn version(self) -> u32 {
        match self {
            Self::Schema | Self::Metadata | Self::Scaler => 1,
        }
    }
}

/// Base id of a feature id: everything before the first partition separator.
#[must_use]
pub fn base_id(id: &str) -> &str {
    id.split_once(PARTITION_SEPARATOR).map_or(id, |(base, _)| base)
}

/* ===================== schema ===================== */

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Scalar,
    Sequence,
}

/// Expected list length of a sequence id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceTarget {
    pub strategy: String,
    pub target: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub id: String,
    pub base_id: String,
    pub kind: EntryKind,
    pub present_count: u64,
    pub null_count: u64,
    pub value_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<CadenceTarget>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorCounts {
    pub feature_vectors: u64,
    pub target_vectors: u64,
}

/// Ordered, expected ids of every sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaArtifact {
    pub schema_version: u32,
    pub features: Vec<SchemaEntry>,
    pub targets: Vec<SchemaEntry>,
    pub counts: VectorCounts,
}

impl SchemaArtifact {
    #[must_use]
    pub fn entries(&self, payload: Payload) -> &[SchemaEntry] {
        match payload {
            Payload::Features => &self.features,
            Payload::Targets => &self.targets,
        }
    }

    #[must_use]
    pub fn ids(&self, payload: Payload) -> Vec<String> {
        self.entries(payload).iter().map(|e| e.id.clone()).collect()
    }
}

/* ===================== metadata ===================== */

/// How the observed window is derived from per-id first/last buckets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Earliest to latest over base ids.
    #[default]
    Union,
    /// Span covered by every base id.
    Intersection,
    /// Span covered by every partitioned id.
    Strict,
    /// Earliest to latest over partitioned ids.
    Relaxed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub id: String,
    pub base_id: String,
    pub kind: EntryKind,
    pub present_count: u64,
    pub null_count: u64,
    /// Non-missing share over all vectors of the payload.
    pub coverage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub start: String,
    /// Exclusive end.
    pub end: String,
    pub mode: WindowMode,
}

impl WindowInfo {
    /// # Errors
    /// Fails when either bound is not a timestamp.
    pub fn bounds(&self) -> Result<Window> {
        Ok(Window::new(parse_timestamp(&self.start)?, parse_timestamp(&self.end)?))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub schema_version: u32,
    pub features: Vec<MetadataEntry>,
    pub targets: Vec<MetadataEntry>,
    pub counts: VectorCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowInfo>,
}

impl VectorMetadata {
    #[must_use]
    pub fn entries(&self, payload: Payload) -> &[MetadataEntry] {
        match payload {
            Payload::Features => &self.features,
            Payload::Targets => &self.targets,
        }
    }
}

/* ===================== scaler ===================== */

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalerEntry {
    pub mean: f64,
    pub std: f64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalerStats {
    pub with_mean: bool,
    pub with_std: bool,
    pub epsilon: f64,
    pub statistics: BTreeMap<String, ScalerEntry>,
}

/// Fits per-id mean/std over the numeric feature cells of a sample stream.
#[derive(Debug, Default)]
pub struct ScalerFitter {
    trackers: BTreeMap<String, RunningStats>,
}

impl ScalerFitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: &Sample) {
        for (id, value) in &sample.features {
            let tracker = self.trackers.entry(id.clone()).or_default();
            match value {
                FeatureValue::Scalar(v) => push_numeric(tracker, v),
                FeatureValue::Sequence(vs) => vs.iter().for_each(|v| push_numeric(tracker, v)),
            }
        }
    }

    #[must_use]
    pub fn finish(self, with_mean: bool, with_std: bool, epsilon: f64) -> ScalerStats {
        let statistics = self
            .trackers
            .into_iter()
            .filter(|(_, t)| t.count > 0)
            .map(|(id, t)| {
                let mean = if with_mean { t.mean } else { 0.0 };
                let std = if with_std { t.std().max(epsilon) } else { 1.0 };
                (id, ScalerEntry { mean, std, count: t.count })
            })
            .collect();
        ScalerStats { with_mean, with_std, epsilon, statistics }
    }
}

/// Same numeric view feature scaling applies, so booleans fit as 0/1.
fn push_numeric(tracker: &mut RunningStats, v: &Value) {
    if let Some(x) = v.as_f64() {
        tracker.push(x);
    }
}

/* ===================== profiling ===================== */

#[derive(Debug, Default)]
struct IdProfile {
    present: u64,
    missing: u64,
    sequence: bool,
    max_len: usize,
    types: BTreeSet<&'static str>,
    first: Option<TimestampMs>,
    last: Option<TimestampMs>,
}

impl IdProfile {
    fn observe(&mut self, key: TimestampMs, value: &FeatureValue) {
        self.present += 1;
        if value.is_missing() {
            self.missing += 1;
        }
        let cells: &[Value] = match value {
            FeatureValue::Scalar(v) => std::slice::from_ref(v),
            FeatureValue::Sequence(vs) => {
                self.sequence = true;
                self.max_len = self.max_len.max(vs.len());
                vs
            }
        };
        for v in cells {
            match v {
                Value::Null => {}
                Value::Bool(_) => {
                    self.types.insert("bool");
                }
                Value::Number(_) => {
                    self.types.insert("number");
                }
                Value::Text(_) => {
                    self.types.insert("text");
                }
            }
        }
        if !value.is_missing() {
            self.first = Some(self.first.map_or(key, |f| f.min(key)));
            self.last = Some(self.last.map_or(key, |l| l.max(key)));
        }
    }

    const fn kind(&self) -> EntryKind {
        if self.sequence { EntryKind::Sequence } else { EntryKind::Scalar }
    }
}

/// Accumulates per-id statistics over a pass of assembled samples.
#[derive(Debug, Default)]
pub struct VectorProfiler {
    features: BTreeMap<String, IdProfile>,
    targets: BTreeMap<String, IdProfile>,
    counts: VectorCounts,
}

impl VectorProfiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: &Sample) {
        if !sample.features.is_empty() {
            self.counts.feature_vectors += 1;
        }
        if !sample.targets.is_empty() {
            self.counts.target_vectors += 1;
        }
        for (id, v) in &sample.features {
            self.features.entry(id.clone()).or_default().observe(sample.key, v);
        }
        for (id, v) in &sample.targets {
            self.targets.entry(id.clone()).or_default().observe(sample.key, v);
        }
    }

    fn schema_entries(profiles: &BTreeMap<String, IdProfile>) -> Vec<SchemaEntry> {
        profiles
            .iter()
            .map(|(id, p)| SchemaEntry {
                id: id.clone(),
                base_id: base_id(id).to_string(),
                kind: p.kind(),
                present_count: p.present,
                null_count: p.missing,
                value_types: p.types.iter().map(|t| (*t).to_string()).collect(),
                cadence: p.sequence.then(|| CadenceTarget { strategy: "max".to_string(), target: p.max_len }),
            })
            .collect()
    }

    #[must_use]
    pub fn schema(&self) -> SchemaArtifact {
        SchemaArtifact {
            schema_version: ArtifactKind::Schema.version(),
            features: Self::schema_entries(&self.features),
            targets: Self::schema_entries(&self.targets),
            counts: self.counts,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn metadata_entries(profiles: &BTreeMap<String, IdProfile>, vectors: u64) -> Vec<MetadataEntry> {
        profiles
            .iter()
            .map(|(id, p)| MetadataEntry {
                id: id.clone(),
                base_id: base_id(id).to_string(),
                kind: p.kind(),
                present_count: p.present,
                null_count: p.missing,
                coverage: if vectors == 0 { 0.0 } else { (p.present - p.missing) as f64 / vectors as f64 },
                first_ts: p.first.map(format_timestamp),
                last_ts: p.last.map(format_timestamp),
            })
            .collect()
    }

    fn ranges(&self, by_base: bool) -> Vec<(TimestampMs, TimestampMs)> {
        let mut grouped: BTreeMap<&str, (TimestampMs, TimestampMs)> = BTreeMap::new();
        for (id, p) in self.features.iter().chain(&self.targets) {
            let (Some(first), Some(last)) = (p.first, p.last) else {
                continue;
            };
            let key = if by_base { base_id(id) } else { id.as_str() };
            let range = grouped.entry(key).or_insert((first, last));
            range.0 = range.0.min(first);
            range.1 = range.1.max(last);
        }
        grouped.into_values().collect()
    }

    /// Observed bucket span per `mode`, as `[first, last + group_by)`.
    #[must_use]
    pub fn observed_window(&self, mode: WindowMode, group_by: Cadence) -> Option<Window> {
        let ranges = self.ranges(matches!(mode, WindowMode::Union | WindowMode::Intersection));
        let (start, last) = match mode {
            WindowMode::Union | WindowMode::Relaxed => {
                (ranges.iter().map(|r| r.0).min()?, ranges.iter().map(|r| r.1).max()?)
            }
            WindowMode::Intersection | WindowMode::Strict => {
                (ranges.iter().map(|r| r.0).max()?, ranges.iter().map(|r| r.1).min()?)
            }
        };
        (start <= last).then(|| Window::new(start, last + group_by.as_millis()))
    }

    /// Metadata document; a configured window takes precedence over the observed one.
    #[must_use]
    pub fn metadata(&self, mode: WindowMode, group_by: Cadence, configured: Option<Window>) -> VectorMetadata {
        let window = configured.or_else(|| self.observed_window(mode, group_by)).map(|w| WindowInfo {
            start: format_timestamp(w.start),
            end: format_timestamp(w.end),
            mode,
        });
        VectorMetadata {
            schema_version: ArtifactKind::Metadata.version(),
            features: Self::metadata_entries(&self.features, self.counts.feature_vectors),
            targets: Self::metadata_entries(&self.targets, self.counts.target_vectors),
            counts: self.counts,
            window,
        }
    }
}

/* ===================== store ===================== */

/// Directory holding artifact files and the build state.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.file_name())
    }

    /// Load an artifact, `None` when it was never written.
    ///
    /// # Errors
    /// Fails when the file exists but cannot be read or parsed.
    pub fn load<T: DeserializeOwned>(&self, kind: ArtifactKind) -> Result<Option<T>> {
        let path = self.path(kind);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).with_context(|| format!("read artifact {}", path.display()))?;
        let value = serde_json::from_str(&text).with_context(|| format!("parse artifact {}", path.display()))?;
        Ok(Some(value))
    }

    /// Load an artifact that must exist.
    ///
    /// # Errors
    /// [`EngineError::MissingArtifact`] when it was never built.
    pub fn require<T: DeserializeOwned>(&self, kind: ArtifactKind) -> Result<T> {
        self.load(kind)?.ok_or_else(|| EngineError::MissingArtifact(kind.key().to_string()).into())
    }

    /// Write an artifact through a temp file and rename. Returns the path
    /// relative to the store root.
    ///
    /// # Errors
    /// Fails when the directory or file cannot be written.
    pub fn save<T: Serialize>(&self, kind: ArtifactKind, value: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .map_err(|e| EngineError::Resource(format!("cannot create {}: {e}", self.root.display())))?;
        let path = self.path(kind);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(value)?)
            .map_err(|e| EngineError::Resource(format!("cannot write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| EngineError::Resource(format!("cannot move {} into place: {e}", path.display())))?;
        debug!(artifact = kind.key(), path = %path.display(), "artifact saved");
        Ok(PathBuf::from(kind.file_name()))
    }

    pub fn schema(&self) -> Result<Option<SchemaArtifact>> {
        self.load(ArtifactKind::Schema)
    }

    pub fn metadata(&self) -> Result<Option<VectorMetadata>> {
        self.load(ArtifactKind::Metadata)
    }

    pub fn scaler(&self) -> Result<Option<ScalerStats>> {
        self.load(ArtifactKind::Scaler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key: i64, pairs: &[(&str, FeatureValue)]) -> Sample {
        let mut s = Sample::new(key);
        for (id, v) in pairs {
            s.features.insert((*id).to_string(), v.clone());
        }
        s
    }

    #[test]
    fn schema_records_sequence_target_length() {
        let mut p = VectorProfiler::new();
        p.observe(&sample(0, &[("a__x", FeatureValue::from(1.0)), ("w", FeatureValue::Sequence(vec![Value::Null; 3]))]));
        p.observe(&sample(1, &[("a__x", FeatureValue::Scalar(Value::Null))]));
        let schema = p.schema();
        assert_eq!(schema.features[0].base_id, "a");
        assert_eq!(schema.features[0].null_count, 1);
        assert_eq!(schema.features[1].kind, EntryKind::Sequence);
        assert_eq!(schema.features[1].cadence.as_ref().map(|c| c.target), Some(3));
        assert_eq!(schema.counts.feature_vectors, 2);
    }

    #[test]
    fn intersection_window_narrows_union() {
        let h = 3_600_000;
        let mut p = VectorProfiler::new();
        for t in 0..10 {
            let mut pairs = vec![("a", FeatureValue::from(1.0))];
            if t >= 4 {
                pairs.push(("b", FeatureValue::from(2.0)));
            }
            p.observe(&sample(t * h, &pairs));
        }
        let union = p.observed_window(WindowMode::Union, Cadence::HOUR).unwrap();
        let inter = p.observed_window(WindowMode::Intersection, Cadence::HOUR).unwrap();
        assert_eq!((union.start, union.end), (0, 10 * h));
        assert_eq!((inter.start, inter.end), (4 * h, 10 * h));
    }

    #[test]
    fn scaler_floors_std_at_epsilon() {
        let mut f = ScalerFitter::new();
        f.observe(&sample(0, &[("a", FeatureValue::from(5.0))]));
        let stats = f.finish(true, true, 1e-6);
        assert_eq!(stats.statistics["a"].mean, 5.0);
        assert_eq!(stats.statistics["a"].std, 1e-6);
    }
}
