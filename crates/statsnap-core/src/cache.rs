//! Tag-aware statistics cache backed by moka

use async_trait::async_trait;
use moka::future::Cache;
use moka::notification::RemovalCause;
use parking_lot::RwLock;
use serde_json::Value;
use statsnap_common::Result;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::ports::StatisticsCache;
use crate::snapshot::SnapshotType;

/// Tag carried by every cached statistics entry
pub const STATISTICS_TAG: &str = "statistics";

/// Tags invalidated after a write of `snapshot_type`
pub fn snapshot_tags(snapshot_type: SnapshotType) -> Vec<String> {
    vec![STATISTICS_TAG.to_string(), snapshot_type.as_str().to_string()]
}

/// Configuration for the cache system
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in cache
    pub max_capacity: u64,
    /// Upper bound on any entry's lifetime
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    value: Value,
    tags: Vec<String>,
    expires_at: Instant,
}

/// Hit/miss counters and index size
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    /// Keys referenced by the tag index
    pub indexed_keys: usize,
}

type TagIndex = RwLock<HashMap<String, HashSet<String>>>;

/// Drop `key` from the index entries of `tags`, removing tags left empty
fn unindex(index: &TagIndex, key: &str, tags: &[String]) {
    let mut index = index.write();
    for tag in tags {
        if let Some(keys) = index.get_mut(tag) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(tag);
            }
        }
    }
}

/// Cache keyed by string with an index from tag to keys.
///
/// Keys leave the index when they are forgotten, flushed, evicted or expire.
pub struct TaggedCache {
    entries: Cache<String, CachedEntry>,
    tags: Arc<TagIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TaggedCache {
    pub fn new(config: CacheConfig) -> Self {
        let tags: Arc<TagIndex> = Arc::default();
        let index = Arc::clone(&tags);
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .eviction_listener(move |key: Arc<String>, entry: CachedEntry, cause| {
                // `put` re-indexes replaced keys itself
                if cause != RemovalCause::Replaced {
                    unindex(&index, &key, &entry.tags);
                }
            })
            .build();

        Self {
            entries,
            tags,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let indexed_keys = self
            .tags
            .read()
            .values()
            .flatten()
            .collect::<HashSet<_>>()
            .len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
            indexed_keys,
        }
    }
}

impl Default for TaggedCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[async_trait]
impl StatisticsCache for TaggedCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.entries.get(key).await {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value))
            }
            Some(_) => {
                self.entries.invalidate(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: Value, tags: &[String], ttl: Duration) -> Result<()> {
        if let Some(previous) = self.entries.get(key).await {
            unindex(&self.tags, key, &previous.tags);
        }

        let entry = CachedEntry {
            value,
            tags: tags.to_vec(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry).await;

        let mut index = self.tags.write();
        for tag in tags {
            index.entry(tag.clone()).or_default().insert(key.to_string());
        }
        Ok(())
    }

    async fn forget(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            if let Some(entry) = self.entries.remove(key).await {
                unindex(&self.tags, key, &entry.tags);
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn flush_by_tags(&self, tags: &[String]) -> Result<usize> {
        let keys: HashSet<String> = {
            let mut index = self.tags.write();
            tags.iter()
                .filter_map(|tag| index.remove(tag))
                .flatten()
                .collect()
        };

        let mut removed = 0;
        for key in &keys {
            if self.entries.remove(key).await.is_some() {
                removed += 1;
            }
        }

        debug!(removed, "Flushed cache tags");
        Ok(removed)
    }
}

/// Return the cached value for `key`, or run `producer`, store its result under
/// `tags` and return it. Cache failures fall back to the producer.
pub async fn remember<F, Fut>(
    cache: &dyn StatisticsCache,
    key: &str,
    tags: &[String],
    ttl: Duration,
    producer: F,
) -> Result<Value>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    match cache.get(key).await {
        Ok(Some(value)) => return Ok(value),
        Ok(None) => {}
        Err(e) => warn!(key, error = %e, "Cache read failed, computing value"),
    }

    let value = producer().await?;
    if let Err(e) = cache.put(key, value.clone(), tags, ttl).await {
        warn!(key, error = %e, "Cache write failed");
    }
    Ok(value)
}
