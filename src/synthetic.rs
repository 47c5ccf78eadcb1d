//! Deterministic synthetic source.
//!
//! Emits one record per tick from `start` to `end` inclusive. The `value`
//! field encodes the tick time so downstream stages have something to chew on:
//!
//! * `linear`: UNIX seconds.
//! * `hour_sin`: `sin(2π · hour / 24)`.
//! * `weekday_sin`: `sin(2π · weekday / 7)`, Monday = 0.
//!
//! ```
//! use ironseries::synthetic::SyntheticParams;
//!
//! let params: SyntheticParams = serde_json::from_value(serde_json::json!({
//!     "start": "2024-01-01T00:00:00Z", "end": "2024-01-01T03:00:00Z"
//! }))?;
//! assert_eq!(params.open()?.count(), 4);
//! # anyhow::Ok(())
//! ```

use crate::record::{RecordStream, TemporalRecord, Value};
use crate::window::{Cadence, TimestampMs, parse_timestamp};
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Linear,
    HourSin,
    WeekdaySin,
}

impl Encoding {
    #[allow(clippy::cast_precision_loss)]
    fn encode(self, ts: TimestampMs) -> Value {
        let Some(dt) = DateTime::from_timestamp_millis(ts) else {
            return Value::Null;
        };
        match self {
            Self::Linear => Value::Number(ts.div_euclid(1000) as f64),
            Self::HourSin => Value::Number((TAU * f64::from(dt.hour()) / 24.0).sin()),
            Self::WeekdaySin => Value::Number((TAU * f64::from(dt.weekday().num_days_from_monday()) / 7.0).sin()),
        }
    }
}

fn hourly() -> Cadence {
    Cadence::HOUR
}

fn value_field() -> String {
    crate::feature::VALUE_FIELD.to_string()
}

/// Parameters of the `synthetic` loader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyntheticParams {
    pub start: String,
    pub end: String,
    #[serde(default = "hourly")]
    pub frequency: Cadence,
    #[serde(default)]
    pub encode: Encoding,
    #[serde(default = "value_field")]
    pub field: String,
    /// Identity stamped on every record.
    #[serde(default)]
    pub identity: BTreeMap<String, Value>,
}

impl SyntheticParams {
    /// # Errors
    /// Unparseable bounds.
    pub fn open(&self) -> Result<RecordStream> {
        let start = parse_timestamp(&self.start).context("synthetic.start")?;
        let end = parse_timestamp(&self.end).context("synthetic.end")?;
        let step = self.frequency.as_millis();
        let encode = self.encode;
        let field = self.field.clone();
        let identity = self.identity.clone();
        let ticks = std::iter::successors(Some(start), move |t| Some(t + step)).take_while(move |t| *t <= end);
        Ok(Box::new(ticks.map(move |t| {
            Ok(TemporalRecord { time: t, identity: identity.clone(), fields: BTreeMap::from([(field.clone(), encode.encode(t))]) })
        })))
    }
}

/// Factory registered as `synthetic`.
///
/// # Errors
/// Invalid parameters.
pub fn open_synthetic(params: &serde_json::Value) -> Result<RecordStream> {
    let params: SyntheticParams = serde_json::from_value(params.clone()).context("synthetic source parameters")?;
    params.open()
}
