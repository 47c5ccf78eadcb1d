//! Assembled samples: one feature map and one target map per time bucket.
//!
//! In JSON a sample reads
//! `{"key": "2024-01-01T00:00:00Z", "features": {"temp": 4.5, "wind": [1.0, 2.0]}, "targets": {...}}`.
//! Maps are ordered by id, so serialization is byte-stable.

use crate::record::Value;
use crate::window::{TimestampMs, format_timestamp, parse_timestamp};
use anyhow::Result;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A pull-based stream of samples.
pub type SampleStream = Box<dyn Iterator<Item = Result<Sample>> + Send>;

/// The value of one feature id in one sample.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    Scalar(Value),
    Sequence(Vec<Value>),
}

impl FeatureValue {
    /// Missing means an explicit null scalar, or a sequence made only of nulls.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Scalar(v) => v.is_null(),
            Self::Sequence(vs) => vs.iter().all(Value::is_null),
        }
    }

    /// Fraction of non-null cells: 0 or 1 for scalars, the non-null share for sequences.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coverage(&self) -> f64 {
        match self {
            Self::Scalar(v) => f64::from(u8::from(!v.is_null())),
            Self::Sequence(vs) if vs.is_empty() => 0.0,
            Self::Sequence(vs) => vs.iter().filter(|v| !v.is_null()).count() as f64 / vs.len() as f64,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => v.as_f64(),
            Self::Sequence(_) => None,
        }
    }

    #[must_use]
    pub const fn is_sequence(&self) -> bool {
        matches!(self, Self::Sequence(_))
    }
}

impl From<Value> for FeatureValue {
    fn from(v: Value) -> Self {
        Self::Scalar(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        Self::Scalar(Value::Number(v))
    }
}

impl Serialize for FeatureValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(v) => v.serialize(serializer),
            Self::Sequence(vs) => vs.serialize(serializer),
        }
    }
}

struct FeatureValueVisitor;

impl<'de> Visitor<'de> for FeatureValueVisitor {
    type Value = FeatureValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar or a list of scalars")
    }

    fn visit_unit<E: de::Error>(self) -> Result<FeatureValue, E> {
        Ok(FeatureValue::Scalar(Value::Null))
    }

    fn visit_none<E: de::Error>(self) -> Result<FeatureValue, E> {
        Ok(FeatureValue::Scalar(Value::Null))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<FeatureValue, E> {
        Ok(FeatureValue::Scalar(Value::Bool(v)))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, v: i64) -> Result<FeatureValue, E> {
        Ok(FeatureValue::Scalar(Value::Number(v as f64)))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<FeatureValue, E> {
        Ok(FeatureValue::Scalar(Value::Number(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<FeatureValue, E> {
        Ok(FeatureValue::Scalar(Value::Number(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<FeatureValue, E> {
        Ok(FeatureValue::Scalar(Value::Text(v.to_string())))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<FeatureValue, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(v) = seq.next_element::<Value>()? {
            out.push(v);
        }
        Ok(FeatureValue::Sequence(out))
    }
}

impl<'de> Deserialize<'de> for FeatureValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FeatureValueVisitor)
    }
}

/// Which half of a sample a vector transform addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Features,
    Targets,
}

/// One assembled vector for one time bucket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Bucket start.
    #[serde(with = "rfc3339")]
    pub key: TimestampMs,
    pub features: BTreeMap<String, FeatureValue>,
    #[serde(default)]
    pub targets: BTreeMap<String, FeatureValue>,
    /// Split label, written only by `output: tag`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,
}

impl Sample {
    #[must_use]
    pub fn new(key: TimestampMs) -> Self {
        Self { key, ..Self::default() }
    }

    #[must_use]
    pub const fn payload(&self, which: Payload) -> &BTreeMap<String, FeatureValue> {
        match which {
            Payload::Features => &self.features,
            Payload::Targets => &self.targets,
        }
    }

    pub const fn payload_mut(&mut self, which: Payload) -> &mut BTreeMap<String, FeatureValue> {
        match which {
            Payload::Features => &mut self.features,
            Payload::Targets => &mut self.targets,
        }
    }

    /// True when neither features nor targets carry anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.targets.is_empty()
    }
}

/// Millisecond timestamps as RFC 3339 strings.
pub mod rfc3339 {
    use super::{TimestampMs, format_timestamp, parse_timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    /// # Errors
    /// Never fails for in-range timestamps.
    pub fn serialize<S: Serializer>(ts: &TimestampMs, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(*ts))
    }

    /// # Errors
    /// Fails on text that is not a timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimestampMs, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(|e| serde::de::Error::custom(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_json_shape() {
        let mut s = Sample::new(0);
        s.features.insert("a".into(), FeatureValue::from(1.5));
        s.features.insert("b".into(), FeatureValue::Sequence(vec![Value::Null, Value::Number(2.0)]));
        let text = serde_json::to_string(&s).unwrap();
        assert_eq!(text, r#"{"key":"1970-01-01T00:00:00Z","features":{"a":1.5,"b":[null,2.0]},"targets":{}}"#);
        let back: Sample = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn coverage_of_sequences() {
        let v = FeatureValue::Sequence(vec![Value::Null, Value::Number(1.0), Value::Number(2.0), Value::Null]);
        assert!((v.coverage() - 0.5).abs() < 1e-12);
        assert!(!v.is_missing());
        assert!(FeatureValue::Sequence(vec![Value::Null]).is_missing());
    }
}
