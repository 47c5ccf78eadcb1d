//! Time primitives: UTC millisecond timestamps, cadences and bucket windows.

use crate::error::EngineError;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Milliseconds since UNIX epoch (UTC).
pub type TimestampMs = i64;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

static CADENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(ms|s|sec|m|min|h|d)\s*$").expect("static cadence pattern")
});

/// A fixed, positive time interval such as `10m` or `1h`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cadence {
    millis: i64,
}

impl Cadence {
    /// # Errors
    /// Fails when `millis` is not positive.
    pub fn from_millis(millis: i64) -> Result<Self> {
        if millis <= 0 {
            return Err(EngineError::config("cadence", format!("cadence must be positive, got {millis}ms")).into());
        }
        Ok(Self { millis })
    }

    /// One hour.
    pub const HOUR: Self = Self { millis: HOUR_MS };

    #[inline]
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.millis
    }

    /// Floor a timestamp to the start of its cadence bucket. Buckets are
    /// aligned to the UNIX epoch, also for negative timestamps.
    #[inline]
    #[must_use]
    pub const fn floor(&self, ts: TimestampMs) -> TimestampMs {
        ts - ts.rem_euclid(self.millis)
    }
}

impl FromStr for Cadence {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = CADENCE_RE
            .captures(s)
            .ok_or_else(|| EngineError::config("cadence", format!("malformed cadence string {s:?}")))?;
        let n: i64 = caps[1]
            .parse()
            .map_err(|_| EngineError::config("cadence", format!("cadence amount out of range in {s:?}")))?;
        let unit = match &caps[2] {
            "ms" => 1,
            "s" | "sec" => SECOND_MS,
            "m" | "min" => MINUTE_MS,
            "h" => HOUR_MS,
            _ => DAY_MS,
        };
        let millis = n
            .checked_mul(unit)
            .ok_or_else(|| EngineError::config("cadence", format!("cadence out of range in {s:?}")))?;
        if millis == 0 {
            return Err(EngineError::config("cadence", format!("cadence must be positive, got {s:?}")));
        }
        Ok(Self { millis })
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.millis;
        if m % DAY_MS == 0 {
            write!(f, "{}d", m / DAY_MS)
        } else if m % HOUR_MS == 0 {
            write!(f, "{}h", m / HOUR_MS)
        } else if m % MINUTE_MS == 0 {
            write!(f, "{}m", m / MINUTE_MS)
        } else if m % SECOND_MS == 0 {
            write!(f, "{}s", m / SECOND_MS)
        } else {
            write!(f, "{m}ms")
        }
    }
}

impl Serialize for Cadence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cadence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A closed-open time range: `[start, end)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start: TimestampMs,
    pub end: TimestampMs,
}

impl Window {
    #[inline]
    #[must_use]
    pub fn new(start: TimestampMs, end: TimestampMs) -> Self {
        debug_assert!(end >= start);
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, ts: TimestampMs) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Parse an RFC 3339 timestamp (or a naive `YYYY-MM-DD[THH:MM:SS]`, read as UTC).
///
/// # Errors
/// Returns a configuration error when the text is not a recognizable timestamp.
pub fn parse_timestamp(text: &str) -> Result<TimestampMs> {
    let t = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).map_or(0, |d| d.and_utc().timestamp_millis()));
    }
    Err(EngineError::config("timestamp", format!("cannot parse timestamp {t:?}")).into())
}

/// Render a timestamp as RFC 3339 with a `Z` suffix.
#[must_use]
pub fn format_timestamp(ts: TimestampMs) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map_or_else(|| ts.to_string(), |dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}
