//! Cached read path for stored snapshots

use statsnap_common::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{remember, snapshot_tags};
use crate::period::Period;
use crate::ports::{SnapshotRepository, StatisticsCache};
use crate::snapshot::{Snapshot, SnapshotType};

/// Serves snapshot lookups through the statistics cache
#[derive(Clone)]
pub struct SnapshotReader {
    repository: Arc<dyn SnapshotRepository>,
    cache: Arc<dyn StatisticsCache>,
    ttl: Duration,
}

impl SnapshotReader {
    pub fn new(
        repository: Arc<dyn SnapshotRepository>,
        cache: Arc<dyn StatisticsCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            repository,
            cache,
            ttl,
        }
    }

    pub fn cache_key(snapshot_type: SnapshotType, period: &Period) -> String {
        format!("snapshot:{}:{}", snapshot_type, period.key())
    }

    pub async fn find(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
    ) -> Result<Option<Snapshot>> {
        let key = Self::cache_key(snapshot_type, period);
        let repository = Arc::clone(&self.repository);
        let period = *period;

        let value = remember(
            self.cache.as_ref(),
            &key,
            &snapshot_tags(snapshot_type),
            self.ttl,
            move || async move {
                let snapshot = repository
                    .find_by_type_and_period(snapshot_type, &period)
                    .await?;
                Ok(serde_json::to_value(snapshot)?)
            },
        )
        .await?;

        Ok(serde_json::from_value(value)?)
    }
}
