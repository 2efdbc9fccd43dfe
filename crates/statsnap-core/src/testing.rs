//! Test doubles for the port traits
//!
//! Enabled through the `testing` feature so that downstream crates can drive
//! the aggregation service without a real activity store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use statsnap_common::{Result, StatsError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::period::Period;
use crate::ports::{
    ActiveUser, ActivitySummary, LengthStats, PopularPost, PostActivitySource, RegistrationPoint,
    RetentionStats, SnapshotRepository, StatisticsCache, UserActivitySource,
};
use crate::repository::InMemorySnapshotRepository;
use crate::snapshot::{Snapshot, SnapshotType};

/// Source returning the same numbers for every period
#[derive(Debug, Clone)]
pub struct FixedActivitySource {
    pub total_posts: u64,
    pub active_users: u64,
    pub new_users: u64,
    pub has_posts: bool,
    pub has_users: bool,
}

impl Default for FixedActivitySource {
    fn default() -> Self {
        Self {
            total_posts: 12,
            active_users: 4,
            new_users: 2,
            has_posts: true,
            has_users: true,
        }
    }
}

impl FixedActivitySource {
    pub fn empty() -> Self {
        Self {
            total_posts: 0,
            active_users: 0,
            new_users: 0,
            has_posts: false,
            has_users: false,
        }
    }
}

#[async_trait]
impl PostActivitySource for FixedActivitySource {
    async fn total_posts_count(&self, _period: &Period) -> Result<u64> {
        Ok(self.total_posts)
    }

    async fn post_activity_summary(&self, period: &Period) -> Result<ActivitySummary> {
        Ok(ActivitySummary {
            total_posts: self.total_posts,
            total_views: self.total_posts * 10,
            unique_authors: self.active_users,
            average_views: if self.total_posts == 0 { 0.0 } else { 10.0 },
            busiest_day: (self.total_posts > 0).then(|| period.start_date()),
        })
    }

    async fn posts_count_by_status(&self, _period: &Period) -> Result<BTreeMap<String, u64>> {
        Ok(BTreeMap::from([("published".to_string(), self.total_posts)]))
    }

    async fn posts_count_by_source(&self, _period: &Period) -> Result<BTreeMap<String, u64>> {
        Ok(BTreeMap::from([("web".to_string(), self.total_posts)]))
    }

    async fn popular_posts(&self, period: &Period, limit: usize) -> Result<Vec<PopularPost>> {
        Ok((0..self.total_posts.min(limit as u64))
            .map(|rank| PopularPost {
                post_id: format!("post-{}", rank + 1),
                title: format!("Post {}", rank + 1),
                author_id: "author-1".to_string(),
                views: 100u64.saturating_sub(rank * 10),
                created_at: period.start_time(),
            })
            .collect())
    }

    async fn post_length_stats(&self, _period: &Period) -> Result<LengthStats> {
        Ok(LengthStats {
            min: 10,
            max: 200,
            average: 80.0,
            median: 75.0,
        })
    }

    async fn has_data_for_period(&self, _period: &Period) -> Result<bool> {
        Ok(self.has_posts)
    }
}

#[async_trait]
impl UserActivitySource for FixedActivitySource {
    async fn active_users_count(&self, _period: &Period) -> Result<u64> {
        Ok(self.active_users)
    }

    async fn new_users_count(&self, _period: &Period) -> Result<u64> {
        Ok(self.new_users)
    }

    async fn most_active_users(&self, _period: &Period, limit: usize) -> Result<Vec<ActiveUser>> {
        Ok((0..self.active_users.min(limit as u64))
            .map(|rank| ActiveUser {
                user_id: format!("user-{}", rank + 1),
                username: format!("user{}", rank + 1),
                post_count: self.active_users - rank,
            })
            .collect())
    }

    async fn registration_trend(&self, period: &Period) -> Result<Vec<RegistrationPoint>> {
        Ok(vec![RegistrationPoint {
            date: period.start_date(),
            count: self.new_users,
        }])
    }

    async fn retention_analysis(&self, _period: &Period) -> Result<RetentionStats> {
        Ok(RetentionStats::default())
    }

    async fn has_data_for_period(&self, _period: &Period) -> Result<bool> {
        Ok(self.has_users)
    }
}

/// Wrapper failing the first `failures` calls with a retryable data-source error
#[derive(Debug)]
pub struct FlakySource<S> {
    inner: S,
    remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl<S> FlakySource<S> {
    pub fn new(inner: S, failures: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tripped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StatsError::data_source("injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: PostActivitySource> PostActivitySource for FlakySource<S> {
    async fn total_posts_count(&self, period: &Period) -> Result<u64> {
        self.trip()?;
        self.inner.total_posts_count(period).await
    }

    async fn post_activity_summary(&self, period: &Period) -> Result<ActivitySummary> {
        self.trip()?;
        self.inner.post_activity_summary(period).await
    }

    async fn posts_count_by_status(&self, period: &Period) -> Result<BTreeMap<String, u64>> {
        self.trip()?;
        self.inner.posts_count_by_status(period).await
    }

    async fn posts_count_by_source(&self, period: &Period) -> Result<BTreeMap<String, u64>> {
        self.trip()?;
        self.inner.posts_count_by_source(period).await
    }

    async fn popular_posts(&self, period: &Period, limit: usize) -> Result<Vec<PopularPost>> {
        self.trip()?;
        self.inner.popular_posts(period, limit).await
    }

    async fn post_length_stats(&self, period: &Period) -> Result<LengthStats> {
        self.trip()?;
        self.inner.post_length_stats(period).await
    }

    async fn has_data_for_period(&self, period: &Period) -> Result<bool> {
        self.trip()?;
        PostActivitySource::has_data_for_period(&self.inner, period).await
    }
}

/// Repository whose inserts and updates start failing once `allowed_writes`
/// have succeeded. Replacements and deletes are never limited.
pub struct WriteLimitedRepository {
    inner: InMemorySnapshotRepository,
    allowed_writes: AtomicUsize,
}

impl WriteLimitedRepository {
    pub fn new(allowed_writes: usize) -> Self {
        Self {
            inner: InMemorySnapshotRepository::new(),
            allowed_writes: AtomicUsize::new(allowed_writes),
        }
    }

    fn take_write(&self) -> Result<()> {
        self.allowed_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map(|_| ())
            .map_err(|_| StatsError::repository("write limit reached"))
    }
}

#[async_trait]
impl SnapshotRepository for WriteLimitedRepository {
    async fn exists(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool> {
        self.inner.exists(snapshot_type, period).await
    }

    async fn save(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.take_write()?;
        self.inner.save(snapshot).await
    }

    async fn update(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.take_write()?;
        self.inner.update(snapshot).await
    }

    async fn replace(&self, snapshot: Snapshot) -> Result<Option<Snapshot>> {
        self.inner.replace(snapshot).await
    }

    async fn delete(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool> {
        self.inner.delete(snapshot_type, period).await
    }

    async fn find_by_type_and_period(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
    ) -> Result<Option<Snapshot>> {
        self.inner.find_by_type_and_period(snapshot_type, period).await
    }

    async fn find_by_type(&self, snapshot_type: SnapshotType) -> Result<Vec<Snapshot>> {
        self.inner.find_by_type(snapshot_type).await
    }

    async fn delete_expired_snapshots(&self, before: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_expired_snapshots(before).await
    }
}

/// Cache that rejects every operation
#[derive(Debug, Default)]
pub struct FailingCache;

#[async_trait]
impl StatisticsCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Err(StatsError::cache("cache unavailable"))
    }

    async fn put(&self, _key: &str, _value: Value, _tags: &[String], _ttl: Duration) -> Result<()> {
        Err(StatsError::cache("cache unavailable"))
    }

    async fn forget(&self, _keys: &[String]) -> Result<()> {
        Err(StatsError::cache("cache unavailable"))
    }

    async fn flush_by_tags(&self, _tags: &[String]) -> Result<usize> {
        Err(StatsError::cache("cache unavailable"))
    }
}
