//! Record builders.

use crate::record::{RecordStream, TemporalRecord, Value};
use crate::window::TimestampMs;

pub const HOUR_MS: i64 = 3_600_000;

/// `values[i]` at `start + i` hours, in the `value` field. `NaN` becomes null.
#[must_use]
pub fn hourly_records(start: TimestampMs, values: &[f64]) -> RecordStream {
    let recs: Vec<TemporalRecord> = values
        .iter()
        .zip(0i64..)
        .map(|(v, i)| RecordBuilder::at(start + i * HOUR_MS).value(*v).build())
        .collect();
    Box::new(recs.into_iter().map(Ok))
}

/// Fluent [`TemporalRecord`] construction.
///
/// ```
/// use ironseries::testing::RecordBuilder;
///
/// let r = RecordBuilder::at(0).identity("station", "a").value(1.5).build();
/// assert_eq!(r.numeric("value"), Some(1.5));
/// ```
#[derive(Clone, Debug)]
pub struct RecordBuilder {
    rec: TemporalRecord,
}

impl RecordBuilder {
    #[must_use]
    pub fn at(time: TimestampMs) -> Self {
        Self { rec: TemporalRecord::new(time) }
    }

    #[must_use]
    pub fn identity(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.rec.identity.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.rec.fields.insert(key.to_string(), value.into());
        self
    }

    /// Set the `value` field; `NaN` becomes null.
    #[must_use]
    pub fn value(self, v: f64) -> Self {
        let v = if v.is_nan() { Value::Null } else { Value::Number(v) };
        self.field("value", v)
    }

    #[must_use]
    pub fn build(self) -> TemporalRecord {
        self.rec
    }
}

/// Box already-built records into a stream.
#[must_use]
pub fn stream_of(records: Vec<TemporalRecord>) -> RecordStream {
    Box::new(records.into_iter().map(Ok))
}
