//! Traits for the collaborators the aggregation pipeline consumes
//!
//! Data sources, snapshot persistence and the cache are all injected as
//! `Arc<dyn Trait>` handles so that storage backends stay swappable.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statsnap_common::Result;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::period::Period;
use crate::snapshot::{Snapshot, SnapshotType};

/// Headline activity numbers for posts in a period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub total_posts: u64,
    pub total_views: u64,
    pub unique_authors: u64,
    pub average_views: f64,
    /// Day with the most posts, earliest wins on ties
    pub busiest_day: Option<NaiveDate>,
}

/// A ranked post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularPost {
    pub post_id: String,
    pub title: String,
    pub author_id: String,
    pub views: u64,
    pub created_at: DateTime<Utc>,
}

/// Body length distribution of posts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LengthStats {
    pub min: u64,
    pub max: u64,
    pub average: f64,
    pub median: f64,
}

/// A user ranked by activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub user_id: String,
    pub username: String,
    pub post_count: u64,
}

/// Registrations on one calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPoint {
    pub date: NaiveDate,
    pub count: u64,
}

/// How many users registered before the period were active during it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionStats {
    pub cohort_size: u64,
    pub retained: u64,
    /// Percentage of the cohort that was active, 0 for an empty cohort
    pub retention_rate: f64,
}

/// Post-activity data provider
#[async_trait]
pub trait PostActivitySource: Send + Sync {
    async fn total_posts_count(&self, period: &Period) -> Result<u64>;

    async fn post_activity_summary(&self, period: &Period) -> Result<ActivitySummary>;

    async fn posts_count_by_status(&self, period: &Period) -> Result<BTreeMap<String, u64>>;

    async fn posts_count_by_source(&self, period: &Period) -> Result<BTreeMap<String, u64>>;

    async fn popular_posts(&self, period: &Period, limit: usize) -> Result<Vec<PopularPost>>;

    async fn post_length_stats(&self, period: &Period) -> Result<LengthStats>;

    async fn has_data_for_period(&self, period: &Period) -> Result<bool>;
}

/// User-activity data provider
#[async_trait]
pub trait UserActivitySource: Send + Sync {
    async fn active_users_count(&self, period: &Period) -> Result<u64>;

    async fn new_users_count(&self, period: &Period) -> Result<u64>;

    async fn most_active_users(&self, period: &Period, limit: usize) -> Result<Vec<ActiveUser>>;

    async fn registration_trend(&self, period: &Period) -> Result<Vec<RegistrationPoint>>;

    async fn retention_analysis(&self, period: &Period) -> Result<RetentionStats>;

    async fn has_data_for_period(&self, period: &Period) -> Result<bool>;
}

/// Snapshot persistence
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn exists(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool>;

    /// Store a new snapshot. Fails with `DuplicateSnapshot` if the key is taken.
    async fn save(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Overwrite a stored snapshot, matched by id.
    async fn update(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Force-overwrite path: store the snapshot, replacing whatever occupies its key.
    /// Returns the snapshot that was displaced, if any.
    async fn replace(&self, snapshot: Snapshot) -> Result<Option<Snapshot>>;

    async fn delete(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool>;

    async fn find_by_type_and_period(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
    ) -> Result<Option<Snapshot>>;

    /// All snapshots of a type ordered by period start
    async fn find_by_type(&self, snapshot_type: SnapshotType) -> Result<Vec<Snapshot>>;

    /// Bulk-remove snapshots whose expiry is at or before `before`.
    async fn delete_expired_snapshots(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Key/tag based cache
#[async_trait]
pub trait StatisticsCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value, tags: &[String], ttl: Duration) -> Result<()>;

    async fn forget(&self, keys: &[String]) -> Result<()>;

    /// Drop every entry carrying any of `tags`; returns how many were removed.
    async fn flush_by_tags(&self, tags: &[String]) -> Result<usize>;
}
