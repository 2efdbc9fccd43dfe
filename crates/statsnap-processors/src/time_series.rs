//! Time-series normalization and bucketing

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statsnap_common::utils::start_of_day;
use statsnap_common::{Result, StatsError};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

const TIMESTAMP_KEYS: [&str; 4] = ["timestamp", "date", "time", "created_at"];
const VALUE_KEYS: [&str; 3] = ["value", "count", "total"];

/// Days covered by the fallback range of an empty series
pub const DEFAULT_RANGE_DAYS: i64 = 30;

/// One point of a normalized series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Inclusive time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Bucket width for time-series aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGranularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGranularity::Hour => "hour",
            TimeGranularity::Day => "day",
            TimeGranularity::Week => "week",
            TimeGranularity::Month => "month",
            TimeGranularity::Year => "year",
        }
    }

    /// Start of the bucket containing `timestamp`
    pub fn truncate(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let date = timestamp.date_naive();
        match self {
            TimeGranularity::Hour => {
                start_of_day(date) + Duration::hours(i64::from(timestamp.hour()))
            }
            TimeGranularity::Day => start_of_day(date),
            TimeGranularity::Week => start_of_day(
                date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            ),
            TimeGranularity::Month => start_of_day(date.with_day(1).unwrap_or(date)),
            TimeGranularity::Year => start_of_day(date.with_ordinal(1).unwrap_or(date)),
        }
    }

    /// Start of the bucket following the one that starts at `bucket`
    pub fn next(&self, bucket: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeGranularity::Hour => bucket + Duration::hours(1),
            TimeGranularity::Day => bucket + Duration::days(1),
            TimeGranularity::Week => bucket + Duration::weeks(1),
            TimeGranularity::Month => {
                let date = bucket.date_naive();
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .map(start_of_day)
                    .unwrap_or(bucket + Duration::days(31))
            }
            TimeGranularity::Year => {
                let date = bucket.date_naive();
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                    .map(start_of_day)
                    .unwrap_or(bucket + Duration::days(366))
            }
        }
    }
}

impl fmt::Display for TimeGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeGranularity {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(TimeGranularity::Hour),
            "day" => Ok(TimeGranularity::Day),
            "week" => Ok(TimeGranularity::Week),
            "month" => Ok(TimeGranularity::Month),
            "year" => Ok(TimeGranularity::Year),
            other => Err(StatsError::validation_field(
                format!(
                    "Unsupported granularity '{}', expected one of hour, day, week, month, year",
                    other
                ),
                "granularity",
            )),
        }
    }
}

/// Transforms raw time-stamped records into evenly bucketed series
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesProcessor;

impl TimeSeriesProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Turn heterogeneous JSON records into a series ordered by timestamp.
    ///
    /// Records without a usable timestamp are dropped; a missing value counts as 0.
    pub fn normalize(&self, records: &[Value]) -> Vec<SeriesPoint> {
        let mut points: Vec<SeriesPoint> = records
            .iter()
            .filter_map(|record| {
                let timestamp = TIMESTAMP_KEYS
                    .iter()
                    .find_map(|key| record.get(*key).and_then(parse_timestamp))?;
                let value = VALUE_KEYS
                    .iter()
                    .find_map(|key| record.get(*key).and_then(parse_value))
                    .unwrap_or(0.0);
                Some(SeriesPoint { timestamp, value })
            })
            .collect();

        let dropped = records.len() - points.len();
        if dropped > 0 {
            debug!(dropped, "Dropped records without a timestamp");
        }

        points.sort_by_key(|point| point.timestamp);
        points
    }

    /// Range from explicit bounds, else the series' extent, else the
    /// trailing 30 days ending at `now`
    pub fn infer_range(
        &self,
        points: &[SeriesPoint],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> TimeRange {
        let first = points.iter().map(|point| point.timestamp).min();
        let last = points.iter().map(|point| point.timestamp).max();

        match (first, last) {
            (Some(first), Some(last)) => TimeRange {
                start: start.unwrap_or(first),
                end: end.unwrap_or(last),
            },
            _ => {
                let end = end.unwrap_or(now);
                TimeRange {
                    start: start.unwrap_or(end - Duration::days(DEFAULT_RANGE_DAYS)),
                    end,
                }
            }
        }
    }

    pub fn parse_granularity(&self, value: &str) -> Result<TimeGranularity> {
        value.parse()
    }

    /// Sum points into buckets covering `range`, emitting 0 for empty buckets.
    /// Points outside the range are ignored.
    pub fn bucketize(
        &self,
        points: &[SeriesPoint],
        granularity: TimeGranularity,
        range: TimeRange,
    ) -> Vec<SeriesPoint> {
        let mut buckets = Vec::new();
        let mut bucket = granularity.truncate(range.start);
        while bucket <= range.end {
            buckets.push(SeriesPoint {
                timestamp: bucket,
                value: 0.0,
            });
            bucket = granularity.next(bucket);
        }

        for point in points {
            if point.timestamp < range.start || point.timestamp > range.end {
                continue;
            }
            let key = granularity.truncate(point.timestamp);
            if let Ok(position) = buckets.binary_search_by_key(&key, |bucket| bucket.timestamp) {
                buckets[position].value += point.value;
            }
        }

        buckets
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&parsed));
            }
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|date| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
        }
        Value::Number(number) => number
            .as_i64()
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single()),
        _ => None,
    }
}

fn parse_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
