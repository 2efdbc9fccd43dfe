//! Aggregation service: builds snapshots from the activity sources, persists
//! them and keeps the statistics cache consistent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statsnap_common::utils::round_to;
use statsnap_common::{Result, StatsError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{snapshot_tags, STATISTICS_TAG};
use crate::period::Period;
use crate::ports::{PostActivitySource, SnapshotRepository, StatisticsCache, UserActivitySource};
use crate::snapshot::{Metadata, Snapshot, SnapshotType, StatisticsData};

const SOURCE_KEY: &str = "source";
const GENERATOR_KEY: &str = "generator";
const GENERATOR: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Tunables for snapshot construction
#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub snapshot_ttl: Duration,
    pub popular_limit: usize,
    pub most_active_limit: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            snapshot_ttl: Duration::days(90),
            popular_limit: 10,
            most_active_limit: 10,
        }
    }
}

/// What triggered a snapshot write, recorded under `metadata.source`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Manual,
    Scheduled,
    Backfill,
    Batch,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Manual => "manual",
            SnapshotSource::Scheduled => "scheduled",
            SnapshotSource::Backfill => "backfill",
            SnapshotSource::Batch => "batch",
        }
    }

    /// Metadata map carrying only this source
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(SOURCE_KEY.to_string(), Value::String(self.as_str().to_string()));
        metadata
    }
}

/// Result of `recompute_snapshot`
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    Created(Snapshot),
    Replaced(Snapshot),
    /// A snapshot already existed and force was not requested
    Skipped(Snapshot),
}

impl SnapshotOutcome {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            SnapshotOutcome::Created(snapshot)
            | SnapshotOutcome::Replaced(snapshot)
            | SnapshotOutcome::Skipped(snapshot) => snapshot,
        }
    }

    pub fn into_snapshot(self) -> Snapshot {
        match self {
            SnapshotOutcome::Created(snapshot)
            | SnapshotOutcome::Replaced(snapshot)
            | SnapshotOutcome::Skipped(snapshot) => snapshot,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, SnapshotOutcome::Skipped(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDirection {
    Up,
    Down,
    Flat,
}

/// Change of one metric between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTrend {
    pub current: f64,
    pub previous: f64,
    pub absolute_change: f64,
    pub percentage_change: f64,
    pub trend_direction: ChangeDirection,
}

impl MetricTrend {
    pub fn between(current: f64, previous: f64) -> Self {
        let absolute_change = current - previous;
        let (percentage_change, trend_direction) = if previous == 0.0 {
            (0.0, ChangeDirection::Flat)
        } else {
            let direction = if absolute_change > 0.0 {
                ChangeDirection::Up
            } else if absolute_change < 0.0 {
                ChangeDirection::Down
            } else {
                ChangeDirection::Flat
            };
            (absolute_change / previous * 100.0, direction)
        };

        Self {
            current,
            previous,
            absolute_change,
            percentage_change,
            trend_direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub snapshot_type: SnapshotType,
    pub current_period: Period,
    pub previous_period: Period,
    pub metrics: BTreeMap<String, MetricTrend>,
}

/// A snapshot computed during a batch, waiting to be persisted
enum PendingWrite {
    Keep(Snapshot),
    Save(Snapshot),
    Replace(Snapshot),
}

/// A write already applied during a batch, undone on rollback
struct AppliedWrite {
    snapshot_type: SnapshotType,
    displaced: Option<Snapshot>,
}

/// Core orchestrator over the data sources, repository and cache
#[derive(Clone)]
pub struct AggregationService {
    posts: Arc<dyn PostActivitySource>,
    users: Arc<dyn UserActivitySource>,
    repository: Arc<dyn SnapshotRepository>,
    cache: Arc<dyn StatisticsCache>,
    settings: AggregationSettings,
}

impl AggregationService {
    pub fn new(
        posts: Arc<dyn PostActivitySource>,
        users: Arc<dyn UserActivitySource>,
        repository: Arc<dyn SnapshotRepository>,
        cache: Arc<dyn StatisticsCache>,
        settings: AggregationSettings,
    ) -> Self {
        Self {
            posts,
            users,
            repository,
            cache,
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn SnapshotRepository> {
        &self.repository
    }

    pub fn settings(&self) -> &AggregationSettings {
        &self.settings
    }

    pub async fn create_overview_snapshot(
        &self,
        period: &Period,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot> {
        self.create_typed(SnapshotType::Overview, period, metadata).await
    }

    pub async fn create_posts_snapshot(
        &self,
        period: &Period,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot> {
        self.create_typed(SnapshotType::Posts, period, metadata).await
    }

    pub async fn create_users_snapshot(
        &self,
        period: &Period,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot> {
        self.create_typed(SnapshotType::Users, period, metadata).await
    }

    pub async fn create_popular_snapshot(
        &self,
        period: &Period,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot> {
        self.create_typed(SnapshotType::Popular, period, metadata).await
    }

    pub async fn create_snapshot(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot> {
        match snapshot_type {
            SnapshotType::Overview => self.create_overview_snapshot(period, metadata).await,
            SnapshotType::Posts => self.create_posts_snapshot(period, metadata).await,
            SnapshotType::Users => self.create_users_snapshot(period, metadata).await,
            SnapshotType::Popular => self.create_popular_snapshot(period, metadata).await,
        }
    }

    #[instrument(skip_all, fields(snapshot_type = %snapshot_type, period = %period))]
    async fn create_typed(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot> {
        if self.repository.exists(snapshot_type, period).await? {
            return Err(StatsError::duplicate(snapshot_type, period));
        }

        let data = self.build_statistics(snapshot_type, period).await?;
        let snapshot =
            self.new_snapshot(snapshot_type, period, data, metadata, SnapshotSource::Manual)?;
        let saved = self.repository.save(snapshot).await?;

        info!(id = %saved.id, "Snapshot created");
        self.invalidate(snapshot_type).await;
        Ok(saved)
    }

    /// Compute and persist several snapshot types for one period as a unit.
    ///
    /// Nothing is written until every computation succeeded; a failed write
    /// undoes the writes already applied by this call.
    #[instrument(skip_all, fields(force = force, period = %period))]
    pub async fn create_batch_snapshots<S: AsRef<str>>(
        &self,
        period: &Period,
        types: &[S],
        force: bool,
    ) -> Result<Vec<Snapshot>> {
        let mut requested: Vec<SnapshotType> = Vec::with_capacity(types.len());
        for snapshot_type in SnapshotType::parse_list(types)? {
            if !requested.contains(&snapshot_type) {
                requested.push(snapshot_type);
            }
        }

        let mut pending = Vec::with_capacity(requested.len());
        for snapshot_type in requested {
            let existing = self
                .repository
                .find_by_type_and_period(snapshot_type, period)
                .await?;

            let write = match existing {
                Some(existing) if !force => PendingWrite::Keep(existing),
                Some(existing) => {
                    let data = self.build_statistics(snapshot_type, period).await?;
                    let fresh = self.new_snapshot(
                        snapshot_type,
                        period,
                        data,
                        None,
                        SnapshotSource::Batch,
                    )?;
                    PendingWrite::Replace(supersede(&existing, fresh))
                }
                None => {
                    let data = self.build_statistics(snapshot_type, period).await?;
                    let fresh = self.new_snapshot(
                        snapshot_type,
                        period,
                        data,
                        None,
                        SnapshotSource::Batch,
                    )?;
                    PendingWrite::Save(fresh)
                }
            };
            pending.push(write);
        }

        let mut applied: Vec<AppliedWrite> = Vec::new();
        let mut results = Vec::with_capacity(pending.len());

        for write in pending {
            let outcome = match write {
                PendingWrite::Keep(snapshot) => {
                    results.push(snapshot);
                    continue;
                }
                PendingWrite::Save(snapshot) => {
                    let snapshot_type = snapshot.snapshot_type;
                    self.repository.save(snapshot).await.map(|saved| {
                        applied.push(AppliedWrite { snapshot_type, displaced: None });
                        saved
                    })
                }
                PendingWrite::Replace(snapshot) => {
                    let snapshot_type = snapshot.snapshot_type;
                    self.repository
                        .replace(snapshot.clone())
                        .await
                        .map(|displaced| {
                            applied.push(AppliedWrite { snapshot_type, displaced });
                            snapshot
                        })
                }
            };

            match outcome {
                Ok(snapshot) => results.push(snapshot),
                Err(e) => {
                    error!(error = %e, applied = applied.len(), "Batch write failed, rolling back");
                    self.roll_back(period, applied).await;
                    return Err(e);
                }
            }
        }

        for write in &applied {
            self.invalidate(write.snapshot_type).await;
        }

        info!(written = applied.len(), total = results.len(), "Batch snapshots stored");
        Ok(results)
    }

    async fn roll_back(&self, period: &Period, applied: Vec<AppliedWrite>) {
        for write in applied.into_iter().rev() {
            let undo = match write.displaced {
                Some(previous) => self.repository.replace(previous).await.map(|_| ()),
                None => self
                    .repository
                    .delete(write.snapshot_type, period)
                    .await
                    .map(|_| ()),
            };

            if let Err(e) = undo {
                error!(
                    snapshot_type = %write.snapshot_type,
                    period = %period,
                    error = %e,
                    "Failed to roll back batch write"
                );
            }
        }
    }

    /// Skip-or-recompute path shared by the scheduled and backfill jobs.
    #[instrument(skip_all, fields(snapshot_type = %snapshot_type, period = %period))]
    pub async fn recompute_snapshot(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
        force: bool,
        metadata: Option<Metadata>,
    ) -> Result<SnapshotOutcome> {
        let existing = self
            .repository
            .find_by_type_and_period(snapshot_type, period)
            .await?;

        if let Some(existing) = &existing {
            if !force {
                debug!("Snapshot exists, skipping");
                return Ok(SnapshotOutcome::Skipped(existing.clone()));
            }
        }

        let data = self.build_statistics(snapshot_type, period).await?;
        let fresh =
            self.new_snapshot(snapshot_type, period, data, metadata, SnapshotSource::Manual)?;

        let outcome = match existing {
            Some(existing) => {
                let replacement = supersede(&existing, fresh);
                self.repository.replace(replacement.clone()).await?;
                SnapshotOutcome::Replaced(replacement)
            }
            None => SnapshotOutcome::Created(self.repository.save(fresh).await?),
        };

        self.invalidate(snapshot_type).await;
        Ok(outcome)
    }

    /// Recompute a stored snapshot in place from the same sources.
    #[instrument(skip(self, snapshot), fields(id = %snapshot.id))]
    pub async fn update_snapshot(&self, mut snapshot: Snapshot) -> Result<Snapshot> {
        let now = Utc::now();
        if snapshot.is_expired_at(now) {
            return Err(StatsError::ExpiredSnapshot {
                id: snapshot.id.to_string(),
            });
        }

        let issues = snapshot.integrity_issues();
        if !issues.is_empty() {
            return Err(StatsError::Integrity {
                id: snapshot.id.to_string(),
                message: issues.join("; "),
            });
        }

        let data = self
            .build_statistics(snapshot.snapshot_type, &snapshot.period)
            .await?;
        snapshot.replace_statistics(data, now)?;

        let updated = self.repository.update(snapshot).await?;
        info!(version = updated.version, "Snapshot updated");
        self.invalidate(updated.snapshot_type).await;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn calculate_trends(
        &self,
        current_period: &Period,
        previous_period: &Period,
        snapshot_type: SnapshotType,
    ) -> Result<TrendReport> {
        let current = self
            .repository
            .find_by_type_and_period(snapshot_type, current_period)
            .await?
            .ok_or_else(|| StatsError::not_found(snapshot_type, current_period))?;
        let previous = self
            .repository
            .find_by_type_and_period(snapshot_type, previous_period)
            .await?
            .ok_or_else(|| StatsError::not_found(snapshot_type, previous_period))?;

        let previous_metrics = previous.numeric_metrics();
        let metrics = current
            .numeric_metrics()
            .into_iter()
            .filter_map(|(key, value)| {
                previous_metrics
                    .get(&key)
                    .map(|prior| (key, MetricTrend::between(value, *prior)))
            })
            .collect();

        Ok(TrendReport {
            snapshot_type,
            current_period: *current_period,
            previous_period: *previous_period,
            metrics,
        })
    }

    /// Purge snapshots that expired at or before `before`.
    #[instrument(skip(self))]
    pub async fn clean_expired_snapshots(&self, before: DateTime<Utc>) -> Result<u64> {
        let removed = self.repository.delete_expired_snapshots(before).await?;

        if let Err(e) = self.cache.flush_by_tags(&[STATISTICS_TAG.to_string()]).await {
            warn!(error = %e, "Failed to invalidate statistics cache");
        }

        info!(removed, "Expired snapshots purged");
        Ok(removed)
    }

    /// Gather the payload for one snapshot type, enforcing the data guards.
    pub async fn build_statistics(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
    ) -> Result<StatisticsData> {
        match snapshot_type {
            SnapshotType::Overview => self.overview_statistics(period).await,
            SnapshotType::Posts => {
                if !self.posts.has_data_for_period(period).await? {
                    return Err(StatsError::no_data(snapshot_type, period));
                }
                self.posts_statistics(period).await
            }
            SnapshotType::Users => {
                if !self.users.has_data_for_period(period).await? {
                    return Err(StatsError::no_data(snapshot_type, period));
                }
                self.users_statistics(period).await
            }
            SnapshotType::Popular => self.popular_statistics(period).await,
        }
    }

    async fn overview_statistics(&self, period: &Period) -> Result<StatisticsData> {
        let total_posts = self.posts.total_posts_count(period).await?;
        let active_users = self.users.active_users_count(period).await?;
        let new_users = self.users.new_users_count(period).await?;
        let posts_by_status = self.posts.posts_count_by_status(period).await?;

        let engagement_rate = if active_users == 0 {
            0.0
        } else {
            round_to(total_posts as f64 / active_users as f64, 4)
        };

        let mut data = StatisticsData::new();
        data.insert("total_posts".to_string(), json!(total_posts));
        data.insert("active_users".to_string(), json!(active_users));
        data.insert("new_users".to_string(), json!(new_users));
        data.insert("posts_by_status".to_string(), serde_json::to_value(posts_by_status)?);
        data.insert("engagement_rate".to_string(), json!(engagement_rate));
        Ok(data)
    }

    async fn posts_statistics(&self, period: &Period) -> Result<StatisticsData> {
        let mut data = StatisticsData::new();
        data.insert(
            "total_posts".to_string(),
            json!(self.posts.total_posts_count(period).await?),
        );
        data.insert(
            "activity_summary".to_string(),
            serde_json::to_value(self.posts.post_activity_summary(period).await?)?,
        );
        data.insert(
            "posts_by_status".to_string(),
            serde_json::to_value(self.posts.posts_count_by_status(period).await?)?,
        );
        data.insert(
            "posts_by_source".to_string(),
            serde_json::to_value(self.posts.posts_count_by_source(period).await?)?,
        );
        data.insert(
            "length_stats".to_string(),
            serde_json::to_value(self.posts.post_length_stats(period).await?)?,
        );
        Ok(data)
    }

    async fn users_statistics(&self, period: &Period) -> Result<StatisticsData> {
        let mut data = StatisticsData::new();
        data.insert(
            "active_users".to_string(),
            json!(self.users.active_users_count(period).await?),
        );
        data.insert(
            "new_users".to_string(),
            json!(self.users.new_users_count(period).await?),
        );
        data.insert(
            "most_active_users".to_string(),
            serde_json::to_value(
                self.users
                    .most_active_users(period, self.settings.most_active_limit)
                    .await?,
            )?,
        );
        data.insert(
            "registration_trend".to_string(),
            serde_json::to_value(self.users.registration_trend(period).await?)?,
        );
        data.insert(
            "retention".to_string(),
            serde_json::to_value(self.users.retention_analysis(period).await?)?,
        );
        Ok(data)
    }

    async fn popular_statistics(&self, period: &Period) -> Result<StatisticsData> {
        let popular = self
            .posts
            .popular_posts(period, self.settings.popular_limit)
            .await?;
        let total_views: u64 = popular.iter().map(|post| post.views).sum();

        let mut data = StatisticsData::new();
        data.insert("popular_posts".to_string(), serde_json::to_value(popular)?);
        data.insert("total_views".to_string(), json!(total_views));
        Ok(data)
    }

    fn new_snapshot(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
        data: StatisticsData,
        metadata: Option<Metadata>,
        default_source: SnapshotSource,
    ) -> Result<Snapshot> {
        let mut metadata = metadata.unwrap_or_default();
        metadata
            .entry(SOURCE_KEY.to_string())
            .or_insert_with(|| Value::String(default_source.as_str().to_string()));
        metadata.insert(GENERATOR_KEY.to_string(), Value::String(GENERATOR.to_string()));

        Snapshot::new(
            snapshot_type,
            *period,
            data,
            metadata,
            Utc::now(),
            self.settings.snapshot_ttl,
        )
    }

    async fn invalidate(&self, snapshot_type: SnapshotType) {
        if let Err(e) = self.cache.flush_by_tags(&snapshot_tags(snapshot_type)).await {
            warn!(snapshot_type = %snapshot_type, error = %e, "Cache invalidation failed");
        }
    }
}

/// Carry identity and version history of `existing` over to a recomputed snapshot.
///
/// An expired snapshot is read-only, so it is not continued: the recomputed
/// snapshot takes over its key with a new id and version 1.
fn supersede(existing: &Snapshot, mut fresh: Snapshot) -> Snapshot {
    if existing.is_expired_at(fresh.created_at) {
        return fresh;
    }
    fresh.id = existing.id;
    fresh.version = existing.version + 1;
    fresh.created_at = existing.created_at;
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_trend_up_and_down() {
        let up = MetricTrend::between(150.0, 100.0);
        assert_eq!(up.absolute_change, 50.0);
        assert_eq!(up.percentage_change, 50.0);
        assert_eq!(up.trend_direction, ChangeDirection::Up);

        let down = MetricTrend::between(75.0, 100.0);
        assert_eq!(down.percentage_change, -25.0);
        assert_eq!(down.trend_direction, ChangeDirection::Down);

        let same = MetricTrend::between(10.0, 10.0);
        assert_eq!(same.percentage_change, 0.0);
        assert_eq!(same.trend_direction, ChangeDirection::Flat);
    }

    #[test]
    fn test_metric_trend_zero_previous_is_flat() {
        let trend = MetricTrend::between(42.0, 0.0);
        assert_eq!(trend.absolute_change, 42.0);
        assert_eq!(trend.percentage_change, 0.0);
        assert_eq!(trend.trend_direction, ChangeDirection::Flat);
    }

    #[test]
    fn test_change_direction_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChangeDirection::Up).unwrap(), "\"up\"");
        assert_eq!(serde_json::to_string(&ChangeDirection::Flat).unwrap(), "\"flat\"");
    }

    #[test]
    fn test_source_metadata() {
        let metadata = SnapshotSource::Backfill.metadata();
        assert_eq!(metadata.get("source"), Some(&Value::String("backfill".to_string())));
    }
}
