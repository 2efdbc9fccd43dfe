//! Time windows that snapshots are computed for

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use statsnap_common::utils::start_of_day;
use statsnap_common::{Result, StatsError};
use std::fmt;
use std::str::FromStr;

/// Granularity of a snapshot period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    pub const ALL: [Granularity; 3] =
        [Granularity::Daily, Granularity::Weekly, Granularity::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Granularity::Daily),
            "weekly" => Ok(Granularity::Weekly),
            "monthly" => Ok(Granularity::Monthly),
            _ => Err(StatsError::UnsupportedPeriod {
                period: s.to_string(),
            }),
        }
    }
}

/// Half-open `[start_time, end_time)` window tagged with a granularity.
///
/// The `start_time < end_time` invariant is checked on construction and on
/// deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PeriodRepr")]
pub struct Period {
    granularity: Granularity,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct PeriodRepr {
    granularity: Granularity,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl TryFrom<PeriodRepr> for Period {
    type Error = StatsError;

    fn try_from(repr: PeriodRepr) -> Result<Self> {
        Period::new(repr.granularity, repr.start_time, repr.end_time)
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    // Day 32 after the first always lands in the following month.
    first_of_month(first_of_month(date) + Duration::days(32))
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

impl Period {
    pub fn new(
        granularity: Granularity,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Self> {
        if start_time >= end_time {
            return Err(StatsError::validation_field(
                format!(
                    "Period start {} must be before end {}",
                    start_time.to_rfc3339(),
                    end_time.to_rfc3339()
                ),
                "period",
            ));
        }

        Ok(Self {
            granularity,
            start_time,
            end_time,
        })
    }

    /// The calendar day `date`.
    pub fn daily(date: NaiveDate) -> Self {
        Self {
            granularity: Granularity::Daily,
            start_time: start_of_day(date),
            end_time: start_of_day(date + Duration::days(1)),
        }
    }

    /// The Monday-to-Sunday week containing `date`.
    pub fn weekly(date: NaiveDate) -> Self {
        let monday = monday_of(date);
        Self {
            granularity: Granularity::Weekly,
            start_time: start_of_day(monday),
            end_time: start_of_day(monday + Duration::days(7)),
        }
    }

    /// The calendar month containing `date`.
    pub fn monthly(date: NaiveDate) -> Self {
        Self {
            granularity: Granularity::Monthly,
            start_time: start_of_day(first_of_month(date)),
            end_time: start_of_day(first_of_next_month(date)),
        }
    }

    /// The aligned window of `granularity` that contains `date`.
    pub fn containing(granularity: Granularity, date: NaiveDate) -> Self {
        match granularity {
            Granularity::Daily => Self::daily(date),
            Granularity::Weekly => Self::weekly(date),
            Granularity::Monthly => Self::monthly(date),
        }
    }

    /// Last complete window strictly before the window that contains `now`.
    pub fn previous_complete(granularity: Granularity, now: DateTime<Utc>) -> Self {
        Self::containing(granularity, now.date_naive()).previous()
    }

    /// Adjacent preceding window of the same granularity.
    pub fn previous(&self) -> Self {
        let start = self.start_date();
        match self.granularity {
            Granularity::Daily => Self::daily(start - Duration::days(1)),
            Granularity::Weekly => Self::weekly(start - Duration::days(7)),
            Granularity::Monthly => Self::monthly(start - Duration::days(1)),
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_time.date_naive()
    }

    /// Last calendar day touched by the window.
    pub fn last_date(&self) -> NaiveDate {
        (self.end_time - Duration::nanoseconds(1)).date_naive()
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start_time <= timestamp && timestamp < self.end_time
    }

    /// Number of calendar days covered by the window.
    pub fn days(&self) -> i64 {
        (self.last_date() - self.start_date()).num_days() + 1
    }

    fn is_aligned(&self) -> bool {
        *self == Self::containing(self.granularity, self.start_date())
    }

    /// Stable identifier such as `daily:2024-01-01` or `monthly:2024-01`.
    pub fn key(&self) -> String {
        if !self.is_aligned() {
            return format!(
                "{}:{}..{}",
                self.granularity,
                self.start_time.to_rfc3339(),
                self.end_time.to_rfc3339()
            );
        }

        match self.granularity {
            Granularity::Daily | Granularity::Weekly => {
                format!("{}:{}", self.granularity, self.start_date().format("%Y-%m-%d"))
            }
            Granularity::Monthly => {
                format!("{}:{}", self.granularity, self.start_date().format("%Y-%m"))
            }
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_new_rejects_inverted_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(Period::new(Granularity::Daily, start, end).is_err());
        assert!(Period::new(Granularity::Daily, start, start).is_err());
        assert!(Period::new(Granularity::Daily, end, start).is_ok());
    }

    #[test]
    fn test_daily_boundaries() {
        let period = Period::daily(date(2024, 2, 29));
        assert_eq!(period.start_time(), Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
        assert_eq!(period.end_time(), Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(period.days(), 1);
        assert_eq!(period.key(), "daily:2024-02-29");
    }

    #[test]
    fn test_weekly_runs_monday_to_sunday() {
        // 2024-01-10 is a Wednesday
        let period = Period::weekly(date(2024, 1, 10));
        assert_eq!(period.start_date(), date(2024, 1, 8));
        assert_eq!(period.last_date(), date(2024, 1, 14));
        assert_eq!(period.days(), 7);
    }

    #[test]
    fn test_monthly_handles_year_end_and_leap_years() {
        let december = Period::monthly(date(2023, 12, 15));
        assert_eq!(december.start_date(), date(2023, 12, 1));
        assert_eq!(december.end_time(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let february = Period::monthly(date(2024, 2, 10));
        assert_eq!(february.days(), 29);
        assert_eq!(february.key(), "monthly:2024-02");
    }

    #[test]
    fn test_previous_complete_windows() {
        // Wednesday afternoon
        let now = Utc.with_ymd_and_hms(2024, 3, 13, 15, 30, 0).unwrap();

        let daily = Period::previous_complete(Granularity::Daily, now);
        assert_eq!(daily.start_date(), date(2024, 3, 12));

        let weekly = Period::previous_complete(Granularity::Weekly, now);
        assert_eq!(weekly.start_date(), date(2024, 3, 4));
        assert_eq!(weekly.last_date(), date(2024, 3, 10));

        let monthly = Period::previous_complete(Granularity::Monthly, now);
        assert_eq!(monthly.start_date(), date(2024, 2, 1));
        assert_eq!(monthly.last_date(), date(2024, 2, 29));
    }

    #[test]
    fn test_previous_complete_on_january_first() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let monthly = Period::previous_complete(Granularity::Monthly, now);
        assert_eq!(monthly.key(), "monthly:2023-12");
        let daily = Period::previous_complete(Granularity::Daily, now);
        assert_eq!(daily.key(), "daily:2023-12-31");
    }

    #[test]
    fn test_contains_is_half_open() {
        let period = Period::daily(date(2024, 1, 1));
        assert!(period.contains(period.start_time()));
        assert!(!period.contains(period.end_time()));
    }

    #[test]
    fn test_granularity_parsing() {
        assert_eq!("Weekly".parse::<Granularity>().unwrap(), Granularity::Weekly);
        let error = "hourly".parse::<Granularity>().unwrap_err();
        assert!(matches!(error, StatsError::UnsupportedPeriod { .. }));
    }

    #[test]
    fn test_serde_round_trip_enforces_invariant() {
        let period = Period::weekly(date(2024, 5, 1));
        let json = serde_json::to_string(&period).unwrap();
        let decoded: Period = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, period);

        let inverted = json!({
            "granularity": "daily",
            "start_time": "2024-01-02T00:00:00Z",
            "end_time": "2024-01-01T00:00:00Z"
        })
        .to_string();
        assert!(serde_json::from_str::<Period>(&inverted).is_err());
    }

    #[test]
    fn test_unaligned_key_includes_both_bounds() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap();
        let period = Period::new(Granularity::Daily, start, end).unwrap();
        assert!(period.key().contains(".."));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn any_date() -> impl Strategy<Value = NaiveDate> {
            (0i64..20_000).prop_map(|offset| date(1990, 1, 1) + Duration::days(offset))
        }

        fn any_granularity() -> impl Strategy<Value = Granularity> {
            prop_oneof![
                Just(Granularity::Daily),
                Just(Granularity::Weekly),
                Just(Granularity::Monthly),
            ]
        }

        proptest! {
            #[test]
            fn containing_window_holds_its_date(
                day in any_date(),
                granularity in any_granularity(),
            ) {
                let period = Period::containing(granularity, day);
                prop_assert!(period.contains(start_of_day(day)));
                prop_assert!(period.start_date() <= day && day <= period.last_date());
            }

            #[test]
            fn previous_window_is_adjacent(day in any_date(), granularity in any_granularity()) {
                let period = Period::containing(granularity, day);
                let previous = period.previous();
                prop_assert_eq!(previous.end_time(), period.start_time());
                prop_assert_eq!(previous.granularity(), granularity);
                prop_assert_eq!(Period::containing(granularity, previous.start_date()), previous);
            }
        }
    }
}
