//! Core data types used throughout the roll-up store
//!
//! # Key Types
//!
//! - **`Metric`**: a named, grouped sample (or, on the read side, an aggregated bucket)
//! - **`MetricTimeUnit`**: the four fixed roll-up granularities
//! - **`IndexKind`**: which of the two index tables a query is served from
//!
//! # Example
//!
//! ```rust
//! use rollup_tsdb::types::{Metric, MetricTimeUnit};
//!
//! let metric = Metric::new(1_000, "web", "latency", "p99", 42);
//! assert_eq!(metric.visibility, "");
//!
//! let bucket = MetricTimeUnit::Hours.truncate(3_725_000).unwrap();
//! assert_eq!(bucket, 3_600_000);
//! ```

use crate::error::CodecError;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// A single metric record
///
/// On the write side this is one additive sample. On the read side it is the
/// summed value of one bucket, and `timestamp` is the start of that bucket.
/// Absent identifiers deserialize to the empty string, which is also what the
/// encoder writes for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Metric {
    /// Sample time, or bucket start when read back
    pub timestamp: Timestamp,
    /// Group identifier
    #[serde(default)]
    pub group: String,
    /// Metric type
    #[serde(rename = "type", default)]
    pub metric_type: String,
    /// Metric name
    #[serde(default)]
    pub name: String,
    /// Visibility expression controlling who may read the cell (empty = public)
    #[serde(default)]
    pub visibility: String,
    /// Additive value
    pub value: i64,
}

impl Metric {
    /// Create a public metric
    pub fn new(
        timestamp: Timestamp,
        group: impl Into<String>,
        metric_type: impl Into<String>,
        name: impl Into<String>,
        value: i64,
    ) -> Self {
        Self {
            timestamp,
            group: group.into(),
            metric_type: metric_type.into(),
            name: name.into(),
            visibility: String::new(),
            value,
        }
    }

    /// Attach a visibility expression
    pub fn with_visibility(mut self, visibility: impl Into<String>) -> Self {
        self.visibility = visibility.into();
        self
    }
}

/// Roll-up granularity
///
/// Each variant truncates a timestamp to the start of its bucket (UTC) and
/// owns a distinct column family label, so the four aggregations of a sample
/// never collide inside a row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricTimeUnit {
    /// One-minute buckets
    #[default]
    Minutes,
    /// One-hour buckets
    Hours,
    /// One-day buckets
    Days,
    /// Calendar-month buckets
    Months,
}

const MILLIS_PER_MINUTE: i64 = 60_000;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

impl MetricTimeUnit {
    /// Every granularity, finest first
    pub const ALL: [MetricTimeUnit; 4] = [
        MetricTimeUnit::Minutes,
        MetricTimeUnit::Hours,
        MetricTimeUnit::Days,
        MetricTimeUnit::Months,
    ];

    /// Column family label
    pub fn label(self) -> &'static str {
        match self {
            MetricTimeUnit::Minutes => "MINUTES",
            MetricTimeUnit::Hours => "HOURS",
            MetricTimeUnit::Days => "DAYS",
            MetricTimeUnit::Months => "MONTHS",
        }
    }

    /// Parse a column family label
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|unit| unit.label() == label)
    }

    /// Truncate `timestamp` down to the start of its bucket
    ///
    /// Fails for timestamps outside the years 0000-9999, which the row key
    /// format cannot represent.
    pub fn truncate(self, timestamp: Timestamp) -> Result<Timestamp, CodecError> {
        let datetime = utc_datetime(timestamp)?;
        let truncated = match self {
            MetricTimeUnit::Minutes => timestamp - timestamp.rem_euclid(MILLIS_PER_MINUTE),
            MetricTimeUnit::Hours => timestamp - timestamp.rem_euclid(MILLIS_PER_HOUR),
            MetricTimeUnit::Days => timestamp - timestamp.rem_euclid(MILLIS_PER_DAY),
            MetricTimeUnit::Months => NaiveDate::from_ymd_opt(datetime.year(), datetime.month(), 1)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc().timestamp_millis())
                .ok_or(CodecError::TimestampOutOfRange(timestamp))?,
        };
        Ok(truncated)
    }

    /// Calendar digits of the bucket containing `timestamp`
    ///
    /// `yyyyMMddHHmm` for minutes down to `yyyyMM` for months.
    pub(crate) fn calendar_digits(self, timestamp: Timestamp) -> Result<u64, CodecError> {
        let dt = utc_datetime(timestamp)?;
        let month = dt.year() as u64 * 100 + dt.month() as u64;
        let day = month * 100 + dt.day() as u64;
        let hour = day * 100 + dt.hour() as u64;
        Ok(match self {
            MetricTimeUnit::Months => month,
            MetricTimeUnit::Days => day,
            MetricTimeUnit::Hours => hour,
            MetricTimeUnit::Minutes => hour * 100 + dt.minute() as u64,
        })
    }

    /// Number of decimal digits produced by [`calendar_digits`](Self::calendar_digits)
    pub(crate) fn digit_width(self) -> usize {
        match self {
            MetricTimeUnit::Minutes => 12,
            MetricTimeUnit::Hours => 10,
            MetricTimeUnit::Days => 8,
            MetricTimeUnit::Months => 6,
        }
    }
}

fn utc_datetime(timestamp: Timestamp) -> Result<DateTime<Utc>, CodecError> {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .filter(|dt| (0..=9999).contains(&dt.year()))
        .ok_or(CodecError::TimestampOutOfRange(timestamp))
}

impl fmt::Display for MetricTimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MetricTimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" | "minutes" => Ok(MetricTimeUnit::Minutes),
            "hour" | "hours" => Ok(MetricTimeUnit::Hours),
            "day" | "days" => Ok(MetricTimeUnit::Days),
            "month" | "months" => Ok(MetricTimeUnit::Months),
            other => Err(format!("unknown time unit: {}", other)),
        }
    }
}

/// Which physical index table serves a query
///
/// Both tables receive every sample; they differ only in which identifier
/// leads the row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Row `group + delim + revTS`, qualifier `type + delim + name`
    ByGroup,
    /// Row `type + delim + revTS`, qualifier `group + delim + name`
    #[default]
    ByType,
}

impl IndexKind {
    /// Short label used in logs and telemetry
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::ByGroup => "by_group",
            IndexKind::ByType => "by_type",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-10-18T13:47:25.123Z
    const SAMPLE: Timestamp = 1_792_331_245_123;

    #[test]
    fn test_metric_defaults_on_deserialize() {
        let metric: Metric = serde_json::from_str(r#"{"timestamp": 5, "value": 3}"#).unwrap();
        assert_eq!(metric.group, "");
        assert_eq!(metric.metric_type, "");
        assert_eq!(metric.name, "");
        assert_eq!(metric.visibility, "");
        assert_eq!(metric.value, 3);
    }

    #[test]
    fn test_metric_type_field_name() {
        let metric = Metric::new(1, "g", "t", "n", 2);
        let json = serde_json::to_value(&metric).unwrap();
        assert_eq!(json["type"], "t");
    }

    #[test]
    fn test_truncate_each_unit() {
        let minute = MetricTimeUnit::Minutes.truncate(SAMPLE).unwrap();
        assert_eq!(minute % 60_000, 0);
        assert!(SAMPLE - minute < 60_000);

        let hour = MetricTimeUnit::Hours.truncate(SAMPLE).unwrap();
        assert_eq!(hour % 3_600_000, 0);

        let day = MetricTimeUnit::Days.truncate(SAMPLE).unwrap();
        assert_eq!(day % 86_400_000, 0);

        let month = MetricTimeUnit::Months.truncate(SAMPLE).unwrap();
        let dt = DateTime::<Utc>::from_timestamp_millis(month).unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day(), dt.hour()), (2026, 10, 1, 0));
    }

    #[test]
    fn test_truncate_before_epoch() {
        assert_eq!(MetricTimeUnit::Minutes.truncate(-1).unwrap(), -60_000);
    }

    #[test]
    fn test_truncate_out_of_range() {
        assert_eq!(
            MetricTimeUnit::Days.truncate(i64::MAX),
            Err(CodecError::TimestampOutOfRange(i64::MAX))
        );
    }

    #[test]
    fn test_calendar_digits() {
        assert_eq!(MetricTimeUnit::Minutes.calendar_digits(SAMPLE).unwrap(), 202610181347);
        assert_eq!(MetricTimeUnit::Hours.calendar_digits(SAMPLE).unwrap(), 2026101813);
        assert_eq!(MetricTimeUnit::Days.calendar_digits(SAMPLE).unwrap(), 20261018);
        assert_eq!(MetricTimeUnit::Months.calendar_digits(SAMPLE).unwrap(), 202610);
    }

    #[test]
    fn test_labels_round_trip() {
        for unit in MetricTimeUnit::ALL {
            assert_eq!(MetricTimeUnit::from_label(unit.label()), Some(unit));
        }
        assert_eq!(MetricTimeUnit::from_label("WEEKS"), None);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("hour".parse::<MetricTimeUnit>(), Ok(MetricTimeUnit::Hours));
        assert_eq!("MONTHS".parse::<MetricTimeUnit>(), Ok(MetricTimeUnit::Months));
        assert!("fortnight".parse::<MetricTimeUnit>().is_err());
    }
}
