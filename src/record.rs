//! Temporal records and scalar values.
//!
//! A [`TemporalRecord`] is the unit every stage exchanges: a UTC timestamp, an
//! ordered identity map (used to derive the partition key) and a map of scalar
//! fields. Records are produced by sources or by composition and are never
//! mutated in place downstream; stages build new records instead.
//!
//! ```
//! use ironseries::record::{TemporalRecord, Value};
//!
//! let r = TemporalRecord::new(3_600_000)
//!     .with_identity("station", "oslo")
//!     .with_field("temp", 4.5);
//! assert_eq!(r.partition_key(&["station".to_string()]), "oslo");
//! assert_eq!(r.numeric("temp"), Some(4.5));
//! assert_eq!(r.field("missing"), &Value::Null);
//! ```

use crate::window::TimestampMs;
use anyhow::Result;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Separator between a base id and its partition values, and between partition values.
pub const PARTITION_SEPARATOR: &str = "__";

/// A pull-based, fallible stream of records.
pub type RecordStream = Box<dyn Iterator<Item = Result<TemporalRecord>> + Send>;

/* ===================== Value ===================== */

/// A scalar field value.
///
/// In human-readable formats (JSON) a value is written as the bare scalar
/// (`null`, `true`, `1.5`, `"text"`). Binary formats such as the spool frames
/// use an explicitly tagged encoding.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view. Booleans map to 0/1; NaN numbers count as absent.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) if !n.is_nan() => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering used by filter comparisons: numbers with numbers, text with text.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Null, _) | (_, Self::Null) => None,
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[derive(Serialize, Deserialize)]
enum TaggedValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match self {
                Self::Null => serializer.serialize_unit(),
                Self::Bool(b) => serializer.serialize_bool(*b),
                Self::Number(n) if n.is_finite() => serializer.serialize_f64(*n),
                Self::Number(_) => serializer.serialize_unit(),
                Self::Text(s) => serializer.serialize_str(s),
            }
        } else {
            let tagged = match self {
                Self::Null => TaggedValue::Null,
                Self::Bool(b) => TaggedValue::Bool(*b),
                Self::Number(n) => TaggedValue::Number(*n),
                Self::Text(s) => TaggedValue::Text(s.clone()),
            };
            tagged.serialize(serializer)
        }
    }
}

struct PlainValueVisitor;

impl<'de> Visitor<'de> for PlainValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null, a boolean, a number or a string")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        d.deserialize_any(self)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Number(v as f64))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Text(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, _seq: A) -> Result<Value, A::Error> {
        Err(de::Error::custom("record values must be scalars, found a list"))
    }

    fn visit_map<A: MapAccess<'de>>(self, _map: A) -> Result<Value, A::Error> {
        Err(de::Error::custom("record values must be scalars, found an object"))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(PlainValueVisitor)
        } else {
            Ok(match TaggedValue::deserialize(deserializer)? {
                TaggedValue::Null => Self::Null,
                TaggedValue::Bool(b) => Self::Bool(b),
                TaggedValue::Number(n) => Self::Number(n),
                TaggedValue::Text(s) => Self::Text(s),
            })
        }
    }
}

/* ===================== TemporalRecord ===================== */

/// One observation of a stream at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemporalRecord {
    /// UTC milliseconds since the epoch.
    pub time: TimestampMs,
    /// Identity fields, e.g. a station or ticker id.
    #[serde(default)]
    pub identity: BTreeMap<String, Value>,
    /// Measured fields.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl TemporalRecord {
    #[must_use]
    pub fn new(time: TimestampMs) -> Self {
        Self { time, identity: BTreeMap::new(), fields: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_identity(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.identity.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Field value, [`Value::Null`] when absent.
    #[must_use]
    pub fn field(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(name).unwrap_or(&NULL)
    }

    #[must_use]
    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.field(name).as_f64()
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Partition key derived from the listed identity fields, joined with `__`.
    /// Empty when `by` is empty. Missing identity fields render as `null`.
    #[must_use]
    pub fn partition_key(&self, by: &[String]) -> String {
        let mut out = String::new();
        for (i, name) in by.iter().enumerate() {
            if i > 0 {
                out.push_str(PARTITION_SEPARATOR);
            }
            match self.identity.get(name).or_else(|| self.fields.get(name)) {
                Some(v) => out.push_str(&v.to_string()),
                None => out.push_str("null"),
            }
        }
        out
    }

    /// A placeholder at `time` sharing this record's identity, with every field nulled.
    #[must_use]
    pub fn nulled_at(&self, time: TimestampMs) -> Self {
        Self {
            time,
            identity: self.identity.clone(),
            fields: self.fields.keys().map(|k| (k.clone(), Value::Null)).collect(),
        }
    }
}

/// Box a record iterator into a [`RecordStream`].
pub fn boxed<I>(iter: I) -> RecordStream
where
    I: Iterator<Item = Result<TemporalRecord>> + Send + 'static,
{
    Box::new(iter)
}
