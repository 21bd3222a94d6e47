//! Row key, reverse timestamp and value encoding
//!
//! Every index row is addressed by `identifier + DELIM + reverse_timestamp`.
//! The reverse timestamp is the bucket's calendar digits subtracted from an
//! all-nines sentinel of the same width, zero padded, so that the most recent
//! bucket sorts first under plain lexicographic ordering:
//!
//! ```text
//! unit      digits          sentinel        2026-10-18T13:47Z
//! MINUTES   yyyyMMddHHmm    999999999999    797389818652
//! HOURS     yyyyMMddHH      9999999999      7973898186
//! DAYS      yyyyMMdd        99999999        79738981
//! MONTHS    yyyyMM          999999          797389
//! ```
//!
//! Values are stored as decimal strings, which is the encoding the summing
//! combiner expects.

use crate::error::CodecError;
use crate::types::{MetricTimeUnit, Timestamp};
use bytes::Bytes;
use chrono::NaiveDate;

/// Key part delimiter
///
/// Unprintable and never expected in user identifiers; identifiers that do
/// contain it are rejected by [`validate_identifier`].
pub const DELIM: char = '\u{0}';

const DELIM_STR: &str = "\u{0}";

/// Join key parts with [`DELIM`]
///
/// ```rust
/// use rollup_tsdb::codec::{combine, DELIM};
///
/// assert_eq!(combine(&["web", "p99"]), format!("web{}p99", DELIM));
/// assert_eq!(combine::<&str>(&[]), "");
/// ```
pub fn combine<S: AsRef<str>>(parts: &[S]) -> String {
    let mut key = String::with_capacity(parts.iter().map(|p| p.as_ref().len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(DELIM);
        }
        key.push_str(part.as_ref());
    }
    key
}

/// Split a key into its parts (inverse of [`combine`])
pub fn split(key: &str) -> Vec<&str> {
    key.split(DELIM_STR).collect()
}

/// Reject identifiers that would make a combined key ambiguous
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), CodecError> {
    if value.contains(DELIM) {
        return Err(CodecError::InvalidIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Encode the bucket of `timestamp` so that newer buckets sort first
pub fn reverse_timestamp(timestamp: Timestamp, unit: MetricTimeUnit) -> Result<String, CodecError> {
    let digits = unit.calendar_digits(timestamp)?;
    let width = unit.digit_width();
    Ok(format!("{:0width$}", sentinel(width) - digits, width = width))
}

/// Decode a reverse timestamp back to the start of its bucket (epoch millis)
pub fn revert_timestamp(encoded: &str, unit: MetricTimeUnit) -> Result<Timestamp, CodecError> {
    let width = unit.digit_width();
    let malformed = || CodecError::MalformedTimestamp(encoded.to_string());

    if encoded.len() != width || !encoded.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let reversed: u64 = encoded.parse().map_err(|_| malformed())?;
    let mut digits = sentinel(width) - reversed;

    // Peel calendar fields off the low end; units coarser than minutes
    // simply have fewer fields.
    let (minute, hour, day) = match unit {
        MetricTimeUnit::Minutes => {
            let minute = digits % 100;
            digits /= 100;
            let hour = digits % 100;
            digits /= 100;
            let day = digits % 100;
            digits /= 100;
            (minute, hour, day)
        },
        MetricTimeUnit::Hours => {
            let hour = digits % 100;
            digits /= 100;
            let day = digits % 100;
            digits /= 100;
            (0, hour, day)
        },
        MetricTimeUnit::Days => {
            let day = digits % 100;
            digits /= 100;
            (0, 0, day)
        },
        MetricTimeUnit::Months => (0, 0, 1),
    };
    let month = digits % 100;
    let year = digits / 100;

    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
        .ok_or_else(malformed)
}

/// Build the row key for `identifier` in the bucket of `timestamp`
pub fn row_key(
    identifier: &str,
    timestamp: Timestamp,
    unit: MetricTimeUnit,
) -> Result<String, CodecError> {
    Ok(combine(&[identifier, &reverse_timestamp(timestamp, unit)?]))
}

/// Split a row key into its identifier and bucket start
pub fn parse_row_key(row: &str, unit: MetricTimeUnit) -> Result<(&str, Timestamp), CodecError> {
    let (identifier, encoded) = row
        .split_once(DELIM)
        .ok_or_else(|| CodecError::MalformedRowKey(row.to_string()))?;
    Ok((identifier, revert_timestamp(encoded, unit)?))
}

/// Encode an additive value for the summing combiner
pub fn encode_value(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

/// Decode a combined value
pub fn decode_value(raw: &[u8]) -> Result<i64, CodecError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| CodecError::InvalidValue(String::from_utf8_lossy(raw).into_owned()))
}

fn sentinel(width: usize) -> u64 {
    10u64.pow(width as u32) - 1
}
