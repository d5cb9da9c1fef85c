//! Core data types for the storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `MetricRow`: one ingested sample with its raw label set
//! - `TimeRange`: an inclusive millisecond interval for queries
//! - `RawRow`: a sample resolved to its TSID and waiting for a flush
//! - `Series`: one search result

use crate::storage::metric_name::MetricName;
use crate::storage::tsid::Tsid;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds per day
pub const MSECS_PER_DAY: i64 = 24 * 3600 * 1000;

/// Milliseconds per hour
pub const MSECS_PER_HOUR: i64 = 3600 * 1000;

/// A single sample as produced by a protocol decoder
///
/// `metric_name_raw` holds label pairs in arbitrary order, marshaled with
/// [`MetricName::marshal_raw`]. Rows are consumed once by `add_rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub metric_name_raw: Vec<u8>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub value: f64,
}

impl MetricRow {
    pub fn new(metric_name_raw: Vec<u8>, timestamp: i64, value: f64) -> Self {
        Self {
            metric_name_raw,
            timestamp,
            value,
        }
    }

    /// Build a row from label pairs; `__name__` carries the metric name
    pub fn from_labels<K, V>(labels: &[(K, V)], timestamp: i64, value: f64) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::new(MetricName::marshal_raw(labels), timestamp, value)
    }
}

/// A time interval for queries, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// First timestamp (inclusive), in milliseconds
    pub min_timestamp: i64,
    /// Last timestamp (inclusive), in milliseconds
    pub max_timestamp: i64,
}

impl TimeRange {
    /// Create a time range, returning None if `min > max`
    pub fn try_new(min_timestamp: i64, max_timestamp: i64) -> Option<Self> {
        if min_timestamp <= max_timestamp {
            Some(Self {
                min_timestamp,
                max_timestamp,
            })
        } else {
            None
        }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self {
            min_timestamp: i64::MIN,
            max_timestamp: i64::MAX,
        }
    }

    /// Create a range for the last N hours from now
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now().timestamp_millis();
        Self {
            min_timestamp: end - hours * MSECS_PER_HOUR,
            max_timestamp: end,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.min_timestamp && timestamp <= self.max_timestamp
    }

    /// Check if `[min, max]` overlaps this range
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        min <= self.max_timestamp && max >= self.min_timestamp
    }

    /// Days since the epoch touched by this range, clamped to `>= 0`
    pub fn date_span(&self) -> (u64, u64) {
        (
            timestamp_to_date(self.min_timestamp),
            timestamp_to_date(self.max_timestamp),
        )
    }
}

/// Day number since the Unix epoch for a timestamp
pub fn timestamp_to_date(timestamp: i64) -> u64 {
    if timestamp < 0 {
        0
    } else {
        (timestamp / MSECS_PER_DAY) as u64
    }
}

/// Hour number since the Unix epoch for a timestamp
pub fn timestamp_to_hour(timestamp: i64) -> u64 {
    if timestamp < 0 {
        0
    } else {
        (timestamp / MSECS_PER_HOUR) as u64
    }
}

/// Calendar month `(year, month)` containing a timestamp (UTC)
pub fn timestamp_to_month(timestamp: i64) -> (i32, u32) {
    let dt: DateTime<Utc> = DateTime::from_timestamp_millis(timestamp).unwrap_or_default();
    (dt.year(), dt.month())
}

/// Millisecond bounds `[start, end]` of a calendar month
pub fn month_bounds(year: i32, month: u32) -> TimeRange {
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0);
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let next = NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(i64::MAX);
    TimeRange {
        min_timestamp: start,
        max_timestamp: next - 1,
    }
}

/// A sample resolved to its series, buffered until the next flush
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub tsid: Tsid,
    pub timestamp: i64,
    pub value: f64,
    pub precision_bits: u8,
}

/// One series returned by a search, samples in ascending timestamp order
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub tsid: Tsid,
    pub metric_name: MetricName,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        assert!(TimeRange::try_new(10, 5).is_none());
        let r = TimeRange::try_new(0, 2000).unwrap();
        assert!(r.contains(0));
        assert!(r.contains(2000));
        assert!(!r.contains(2001));
        assert!(r.overlaps(2000, 3000));
        assert!(!r.overlaps(2001, 3000));
    }

    #[test]
    fn test_month_bounds() {
        let r = month_bounds(2024, 2);
        assert_eq!(timestamp_to_month(r.min_timestamp), (2024, 2));
        assert_eq!(timestamp_to_month(r.max_timestamp), (2024, 2));
        assert_eq!(timestamp_to_month(r.max_timestamp + 1), (2024, 3));
        // 2024 is a leap year
        assert_eq!(r.max_timestamp - r.min_timestamp + 1, 29 * MSECS_PER_DAY);

        let dec = month_bounds(2023, 12);
        assert_eq!(timestamp_to_month(dec.max_timestamp + 1), (2024, 1));
    }

    #[test]
    fn test_dates() {
        assert_eq!(timestamp_to_date(-1), 0);
        assert_eq!(timestamp_to_date(MSECS_PER_DAY * 3 + 5), 3);
        assert_eq!(timestamp_to_hour(MSECS_PER_HOUR * 2), 2);
    }
}
