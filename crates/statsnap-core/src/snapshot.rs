//! Snapshot entity and snapshot types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statsnap_common::{Result, StatsError};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::period::Period;

/// Ordered key/value payload; ordering keeps serialization byte-stable.
pub type StatisticsData = BTreeMap<String, Value>;

/// Free-form snapshot annotations
pub type Metadata = BTreeMap<String, Value>;

const CHECKSUM_KEY: &str = "checksum";

/// Kind of statistics a snapshot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    Overview,
    Posts,
    Users,
    Popular,
}

impl SnapshotType {
    pub const ALL: [SnapshotType; 4] = [
        SnapshotType::Overview,
        SnapshotType::Posts,
        SnapshotType::Users,
        SnapshotType::Popular,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::Overview => "overview",
            SnapshotType::Posts => "posts",
            SnapshotType::Users => "users",
            SnapshotType::Popular => "popular",
        }
    }

    /// Keys that must be present in `statistics_data` for this type
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            SnapshotType::Overview => &["total_posts", "active_users", "new_users"],
            SnapshotType::Posts => &["total_posts", "posts_by_status"],
            SnapshotType::Users => &["active_users", "new_users"],
            SnapshotType::Popular => &["popular_posts"],
        }
    }

    /// Parse a list of names, reporting every unknown entry at once.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<SnapshotType>> {
        let mut types = Vec::with_capacity(names.len());
        let mut invalid = Vec::new();

        for name in names {
            match name.as_ref().parse::<SnapshotType>() {
                Ok(snapshot_type) => types.push(snapshot_type),
                Err(_) => invalid.push(name.as_ref().to_string()),
            }
        }

        if invalid.is_empty() {
            Ok(types)
        } else {
            Err(StatsError::InvalidSnapshotType { types: invalid })
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotType {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overview" => Ok(SnapshotType::Overview),
            "posts" => Ok(SnapshotType::Posts),
            "users" => Ok(SnapshotType::Users),
            "popular" => Ok(SnapshotType::Popular),
            _ => Err(StatsError::InvalidSnapshotType {
                types: vec![s.to_string()],
            }),
        }
    }
}

/// One computed statistics result for a `(snapshot_type, period)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub snapshot_type: SnapshotType,
    pub period: Period,
    pub statistics_data: StatisticsData,
    pub metadata: Metadata,
    /// Starts at 1, bumped on every successful update
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        snapshot_type: SnapshotType,
        period: Period,
        statistics_data: StatisticsData,
        mut metadata: Metadata,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self> {
        metadata.insert(
            CHECKSUM_KEY.to_string(),
            Value::String(Self::checksum_of(&statistics_data)?),
        );

        Ok(Self {
            id: Uuid::new_v4(),
            snapshot_type,
            period,
            statistics_data,
            metadata,
            version: 1,
            created_at,
            updated_at: created_at,
            expires_at: created_at + ttl,
        })
    }

    /// MD5 over the canonical JSON encoding of the statistics payload
    pub fn checksum_of(data: &StatisticsData) -> Result<String> {
        let bytes = serde_json::to_vec(data)?;
        Ok(format!("{:x}", md5::compute(bytes)))
    }

    pub fn checksum(&self) -> Option<&str> {
        self.metadata.get(CHECKSUM_KEY).and_then(Value::as_str)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Everything that is wrong with the stored payload; empty when valid.
    pub fn integrity_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match (self.checksum(), Self::checksum_of(&self.statistics_data)) {
            (None, _) => issues.push("checksum missing".to_string()),
            (Some(_), Err(e)) => issues.push(format!("checksum not computable: {}", e)),
            (Some(stored), Ok(actual)) if stored != actual => {
                issues.push("checksum mismatch".to_string())
            }
            (Some(_), Ok(_)) => {}
        }

        for key in self.snapshot_type.required_keys() {
            if !self.statistics_data.contains_key(*key) {
                issues.push(format!("missing required key '{}'", key));
            }
        }

        if self.period.start_time() >= self.period.end_time() {
            issues.push("period start is not before period end".to_string());
        }

        issues
    }

    pub fn validate_data_integrity(&self) -> bool {
        self.integrity_issues().is_empty()
    }

    /// Swap in a freshly computed payload. Expired snapshots are read-only.
    pub fn replace_statistics(&mut self, data: StatisticsData, now: DateTime<Utc>) -> Result<()> {
        if self.is_expired_at(now) {
            return Err(StatsError::ExpiredSnapshot {
                id: self.id.to_string(),
            });
        }

        let checksum = Self::checksum_of(&data)?;
        self.metadata.insert(CHECKSUM_KEY.to_string(), Value::String(checksum));
        self.statistics_data = data;
        self.version += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.statistics_data.get(key).and_then(Value::as_f64)
    }

    /// Top-level numeric entries of the payload
    pub fn numeric_metrics(&self) -> BTreeMap<String, f64> {
        self.statistics_data
            .iter()
            .filter_map(|(key, value)| value.as_f64().map(|number| (key.clone(), number)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    fn overview_data() -> StatisticsData {
        let mut data = StatisticsData::new();
        data.insert("total_posts".to_string(), json!(12));
        data.insert("active_users".to_string(), json!(4));
        data.insert("new_users".to_string(), json!(1));
        data
    }

    fn snapshot() -> Snapshot {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap();
        Snapshot::new(
            SnapshotType::Overview,
            Period::daily(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            overview_data(),
            Metadata::new(),
            created,
            Duration::days(30),
        )
        .unwrap()
    }

    #[test]
    fn test_snapshot_type_parsing() {
        assert_eq!("Popular".parse::<SnapshotType>().unwrap(), SnapshotType::Popular);
        let error = SnapshotType::parse_list(&["posts", "comments", "users", "likes"]).unwrap_err();
        match error {
            StatsError::InvalidSnapshotType { types } => {
                assert_eq!(types, vec!["comments".to_string(), "likes".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_new_snapshot_is_consistent() {
        let snapshot = snapshot();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.checksum().is_some());
        assert!(snapshot.validate_data_integrity());
        assert_eq!(snapshot.metric("total_posts"), Some(12.0));
        assert_eq!(snapshot.numeric_metrics().len(), 3);
    }

    #[test]
    fn test_tampered_payload_fails_integrity() {
        let mut snapshot = snapshot();
        snapshot
            .statistics_data
            .insert("total_posts".to_string(), json!(999));
        assert!(!snapshot.validate_data_integrity());
        assert_eq!(snapshot.integrity_issues(), vec!["checksum mismatch".to_string()]);
    }

    #[test]
    fn test_missing_required_key_fails_integrity() {
        let mut data = overview_data();
        data.remove("new_users");
        let snapshot = Snapshot::new(
            SnapshotType::Overview,
            Period::daily(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            data,
            Metadata::new(),
            Utc::now(),
            Duration::days(1),
        )
        .unwrap();
        assert!(!snapshot.validate_data_integrity());
    }

    #[test]
    fn test_checksum_covers_compact_json_payload() {
        let data = overview_data();
        let encoded = serde_json::to_vec(&data).unwrap();
        let expected = format!("{:x}", md5::compute(&encoded));

        assert_eq!(Snapshot::checksum_of(&data).unwrap(), expected);
        assert_eq!(snapshot().checksum(), Some(expected.as_str()));
    }

    #[test]
    fn test_expired_snapshot_is_read_only() {
        let mut snapshot = snapshot();
        let after_expiry = snapshot.expires_at + Duration::seconds(1);
        assert!(snapshot.is_expired_at(after_expiry));

        let error = snapshot
            .replace_statistics(overview_data(), after_expiry)
            .unwrap_err();
        assert!(matches!(error, StatsError::ExpiredSnapshot { .. }));
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn test_replace_statistics_bumps_version_and_checksum() {
        let mut snapshot = snapshot();
        let before = snapshot.checksum().map(str::to_string);
        let mut data = overview_data();
        data.insert("total_posts".to_string(), json!(20));

        let now = snapshot.created_at + Duration::hours(1);
        snapshot.replace_statistics(data, now).unwrap();

        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.updated_at, now);
        assert_ne!(snapshot.checksum().map(str::to_string), before);
        assert!(snapshot.validate_data_integrity());
    }
}
