//! Deterministic splitter.
//!
//! A label is a pure function of the sample and the split configuration, so
//! re-running over the same data always yields the same assignment, whatever
//! order samples arrive in.
//!
//! * `hash`: SHA-256 of `"{seed}|{token}"`, the first 8 bytes read big-endian,
//!   reduced to `[0, 1)` with 53 bits of precision, then matched against the
//!   cumulative ratios in label order. The token is the bucket time (RFC 3339)
//!   or the JSON text of a feature value.
//! * `time`: the first boundary strictly after the bucket time selects the
//!   label at its index; samples past the last boundary get the last label.
//!
//! ```
//! use ironseries::split::hash_unit;
//!
//! let a = hash_unit(42, "2024-01-01T00:00:00Z");
//! assert_eq!(a, hash_unit(42, "2024-01-01T00:00:00Z"));
//! assert!((0.0..1.0).contains(&a));
//! ```

use crate::error::EngineError;
use crate::metrics::{Counter, RunMetrics};
use crate::sample::{Sample, SampleStream};
use crate::window::{TimestampMs, format_timestamp, parse_timestamp};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

const RATIO_TOLERANCE: f64 = 1e-9;

/// What the hash splitter hashes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SplitKey {
    /// The bucket time.
    #[default]
    Group,
    /// The value of a feature id, falling back to the bucket time when absent.
    Feature(String),
}

impl TryFrom<String> for SplitKey {
    type Error = EngineError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match raw.as_str() {
            "group" => Ok(Self::Group),
            other => match other.strip_prefix("feature:") {
                Some(id) if !id.is_empty() => Ok(Self::Feature(id.to_string())),
                _ => Err(EngineError::config("split.key", format!("expected `group` or `feature:<id>`, got {raw:?}"))),
            },
        }
    }
}

impl From<SplitKey> for String {
    fn from(k: SplitKey) -> Self {
        k.to_string()
    }
}

impl fmt::Display for SplitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group => f.write_str("group"),
            Self::Feature(id) => write!(f, "feature:{id}"),
        }
    }
}

const fn default_seed() -> u64 {
    42
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitMode {
    Hash {
        #[serde(default)]
        key: SplitKey,
        #[serde(default = "default_seed")]
        seed: u64,
        /// Label to fraction. Cumulative intervals follow label order.
        ratios: BTreeMap<String, f64>,
    },
    Time {
        boundaries: Vec<String>,
        labels: Vec<String>,
    },
}

/// Filter to the `keep` label, or tag every sample with its label.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitOutput {
    #[default]
    Filter,
    Tag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitSpec {
    #[serde(flatten)]
    pub mode: SplitMode,
    /// Label to keep in filter mode; no filtering when absent.
    #[serde(default)]
    pub keep: Option<String>,
    #[serde(default)]
    pub output: SplitOutput,
}

impl SplitSpec {
    /// Check ratios, labels and boundaries without building a splitter.
    ///
    /// # Errors
    /// [`EngineError::Config`] naming the offending `split.*` path.
    pub fn validate(&self) -> Result<()> {
        Labeler::new(&self.mode).map(|_| ())
    }

    /// All labels this split can assign.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        match &self.mode {
            SplitMode::Hash { ratios, .. } => ratios.keys().cloned().collect(),
            SplitMode::Time { labels, .. } => labels.clone(),
        }
    }
}

/// Map `"{seed}|{token}"` to a stable point in `[0, 1)`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn hash_unit(seed: u64, token: &str) -> f64 {
    let digest = Sha256::digest(format!("{seed}|{token}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let n = u64::from_be_bytes(head) % (1u64 << 53);
    n as f64 / (1u64 << 53) as f64
}

enum Labeler {
    Hash { key: SplitKey, seed: u64, thresholds: Vec<(f64, String)> },
    Time { boundaries: Vec<TimestampMs>, labels: Vec<String> },
}

impl Labeler {
    fn new(mode: &SplitMode) -> Result<Self> {
        match mode {
            SplitMode::Hash { key, seed, ratios } => {
                if ratios.is_empty() {
                    return Err(EngineError::config("split.ratios", "at least one label is required").into());
                }
                let mut total = 0.0;
                let mut thresholds = Vec::with_capacity(ratios.len());
                for (label, frac) in ratios {
                    if !(*frac > 0.0 && *frac <= 1.0) {
                        return Err(EngineError::config(
                            format!("split.ratios.{label}"),
                            format!("ratio must be in (0, 1], got {frac}"),
                        )
                        .into());
                    }
                    total += frac;
                    thresholds.push((total, label.clone()));
                }
                if (total - 1.0).abs() > RATIO_TOLERANCE {
                    return Err(EngineError::config("split.ratios", format!("ratios must sum to 1, got {total}")).into());
                }
                Ok(Self::Hash { key: key.clone(), seed: *seed, thresholds })
            }
            SplitMode::Time { boundaries, labels } => {
                if labels.len() != boundaries.len() + 1 {
                    return Err(EngineError::config(
                        "split.labels",
                        format!("expected {} labels for {} boundaries, got {}", boundaries.len() + 1, boundaries.len(), labels.len()),
                    )
                    .into());
                }
                let parsed = boundaries.iter().map(|b| parse_timestamp(b)).collect::<Result<Vec<_>>>()?;
                if parsed.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(EngineError::config("split.boundaries", "boundaries must be strictly ascending").into());
                }
                Ok(Self::Time { boundaries: parsed, labels: labels.clone() })
            }
        }
    }

    fn label(&self, sample: &Sample) -> &str {
        match self {
            Self::Hash { key, seed, thresholds } => {
                let token = match key {
                    SplitKey::Feature(id) => sample
                        .features
                        .get(id)
                        .filter(|v| !v.is_missing())
                        .and_then(|v| serde_json::to_string(v).ok()),
                    SplitKey::Group => None,
                }
                .unwrap_or_else(|| format_timestamp(sample.key));
                let r = hash_unit(*seed, &token);
                thresholds
                    .iter()
                    .find(|(t, _)| r < *t)
                    .or_else(|| thresholds.last())
                    .map_or("", |(_, l)| l.as_str())
            }
            Self::Time { boundaries, labels } => {
                let idx = boundaries.iter().position(|b| sample.key < *b).unwrap_or(boundaries.len());
                labels.get(idx).map_or("", String::as_str)
            }
        }
    }
}

/// Assigns labels and applies the configured output mode.
pub struct Splitter {
    labeler: Labeler,
    keep: Option<String>,
    output: SplitOutput,
    metrics: RunMetrics,
}

impl Splitter {
    /// # Errors
    /// Invalid ratios, labels or boundaries.
    pub fn new(spec: &SplitSpec, metrics: RunMetrics) -> Result<Self> {
        Ok(Self { labeler: Labeler::new(&spec.mode)?, keep: spec.keep.clone(), output: spec.output, metrics })
    }

    /// Override the kept label, e.g. to fit statistics on one split.
    #[must_use]
    pub fn keeping(mut self, label: impl Into<String>) -> Self {
        self.keep = Some(label.into());
        self.output = SplitOutput::Filter;
        self
    }

    #[must_use]
    pub fn label<'a>(&'a self, sample: &Sample) -> &'a str {
        self.labeler.label(sample)
    }

    fn route(&self, mut sample: Sample) -> Option<Sample> {
        match (self.output, &self.keep) {
            (SplitOutput::Tag, _) => {
                sample.split = Some(self.label(&sample).to_string());
                Some(sample)
            }
            (SplitOutput::Filter, None) => Some(sample),
            (SplitOutput::Filter, Some(keep)) => {
                if self.label(&sample) == keep {
                    Some(sample)
                } else {
                    self.metrics.increment(Counter::SamplesSplitFiltered, 1);
                    None
                }
            }
        }
    }

    pub fn apply(self, samples: SampleStream) -> SampleStream {
        Box::new(samples.filter_map(move |s| match s {
            Ok(s) => self.route(s).map(Ok),
            Err(e) => Some(Err(e)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parses() {
        let k: SplitKey = serde_json::from_str(r#""feature:temp""#).unwrap();
        assert_eq!(k, SplitKey::Feature("temp".into()));
        assert!(serde_json::from_str::<SplitKey>(r#""feature:""#).is_err());
    }

    #[test]
    fn time_labels_follow_boundaries() {
        let spec: SplitSpec = serde_json::from_str(
            r#"{"mode": "time", "boundaries": ["2024-01-02T00:00:00Z"], "labels": ["train", "test"]}"#,
        )
        .unwrap();
        let s = Splitter::new(&spec, RunMetrics::new()).unwrap();
        let day = 86_400_000;
        let jan1 = parse_timestamp("2024-01-01").unwrap();
        assert_eq!(s.label(&Sample::new(jan1)), "train");
        assert_eq!(s.label(&Sample::new(jan1 + day)), "test");
    }

    #[test]
    fn ratios_must_sum_to_one() {
        let spec: SplitSpec =
            serde_json::from_str(r#"{"mode": "hash", "ratios": {"train": 0.5, "test": 0.4}}"#).unwrap();
        assert!(spec.validate().is_err());
    }
}
