//! Snapshot repository adapters: in-memory and JSON file backed

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use statsnap_common::{Result, StatsError};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::period::Period;
use crate::ports::SnapshotRepository;
use crate::snapshot::{Snapshot, SnapshotType};

type SnapshotKey = (SnapshotType, Period);

/// Keyed snapshot storage shared by both adapters
#[derive(Debug, Default)]
struct SnapshotTable {
    rows: HashMap<SnapshotKey, Snapshot>,
}

impl SnapshotTable {
    fn from_snapshots(snapshots: Vec<Snapshot>) -> Self {
        let rows = snapshots
            .into_iter()
            .map(|snapshot| ((snapshot.snapshot_type, snapshot.period), snapshot))
            .collect();
        Self { rows }
    }

    fn exists(&self, snapshot_type: SnapshotType, period: &Period) -> bool {
        self.rows.contains_key(&(snapshot_type, *period))
    }

    fn save(&mut self, snapshot: Snapshot) -> Result<Snapshot> {
        let key = (snapshot.snapshot_type, snapshot.period);
        if self.rows.contains_key(&key) {
            return Err(StatsError::duplicate(snapshot.snapshot_type, snapshot.period));
        }
        self.rows.insert(key, snapshot.clone());
        Ok(snapshot)
    }

    fn update(&mut self, snapshot: Snapshot) -> Result<Snapshot> {
        let key = (snapshot.snapshot_type, snapshot.period);
        match self.rows.get(&key) {
            Some(stored) if stored.id == snapshot.id => {
                self.rows.insert(key, snapshot.clone());
                Ok(snapshot)
            }
            _ => Err(StatsError::not_found(snapshot.snapshot_type, snapshot.period)),
        }
    }

    fn replace(&mut self, snapshot: Snapshot) -> Option<Snapshot> {
        self.rows
            .insert((snapshot.snapshot_type, snapshot.period), snapshot)
    }

    fn delete(&mut self, snapshot_type: SnapshotType, period: &Period) -> bool {
        self.rows.remove(&(snapshot_type, *period)).is_some()
    }

    fn find(&self, snapshot_type: SnapshotType, period: &Period) -> Option<Snapshot> {
        self.rows.get(&(snapshot_type, *period)).cloned()
    }

    fn find_by_type(&self, snapshot_type: SnapshotType) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self
            .rows
            .values()
            .filter(|snapshot| snapshot.snapshot_type == snapshot_type)
            .cloned()
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.period.start_time());
        snapshots
    }

    fn delete_expired(&mut self, before: DateTime<Utc>) -> u64 {
        let initial = self.rows.len();
        self.rows.retain(|_, snapshot| snapshot.expires_at > before);
        (initial - self.rows.len()) as u64
    }

    fn sorted(&self) -> Vec<&Snapshot> {
        let mut snapshots: Vec<&Snapshot> = self.rows.values().collect();
        snapshots.sort_by_key(|snapshot| (snapshot.snapshot_type, snapshot.period.start_time()));
        snapshots
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Process-local repository, used by tests and one-shot runs
#[derive(Debug, Default)]
pub struct InMemorySnapshotRepository {
    table: RwLock<SnapshotTable>,
}

impl InMemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn exists(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool> {
        Ok(self.table.read().await.exists(snapshot_type, period))
    }

    async fn save(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.table.write().await.save(snapshot)
    }

    async fn update(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.table.write().await.update(snapshot)
    }

    async fn replace(&self, snapshot: Snapshot) -> Result<Option<Snapshot>> {
        Ok(self.table.write().await.replace(snapshot))
    }

    async fn delete(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool> {
        Ok(self.table.write().await.delete(snapshot_type, period))
    }

    async fn find_by_type_and_period(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
    ) -> Result<Option<Snapshot>> {
        Ok(self.table.read().await.find(snapshot_type, period))
    }

    async fn find_by_type(&self, snapshot_type: SnapshotType) -> Result<Vec<Snapshot>> {
        Ok(self.table.read().await.find_by_type(snapshot_type))
    }

    async fn delete_expired_snapshots(&self, before: DateTime<Utc>) -> Result<u64> {
        Ok(self.table.write().await.delete_expired(before))
    }
}

/// Repository persisted as one JSON document.
///
/// Mutations hold an exclusive lock on `<path>.lock`, reload the document,
/// apply the change and write it back through a temporary file and an atomic
/// rename. Several processes can share one store; reads see the latest
/// written document.
#[derive(Debug)]
pub struct FileSnapshotRepository {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileSnapshotRepository {
    /// Open the store at `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let repository = Self {
            lock_path: path.with_file_name(lock_name),
            path,
        };

        let table = repository.load()?;
        info!(
            path = %repository.path.display(),
            snapshots = table.len(),
            "Opened snapshot store"
        );
        Ok(repository)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn load(&self) -> Result<SnapshotTable> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SnapshotTable::default()),
            Err(e) => {
                return Err(StatsError::repository_with_source(
                    format!("Failed to read snapshot store {}", self.path.display()),
                    e,
                ))
            }
        };
        if content.trim().is_empty() {
            return Ok(SnapshotTable::default());
        }
        let snapshots: Vec<Snapshot> = serde_json::from_str(&content)?;
        Ok(SnapshotTable::from_snapshots(snapshots))
    }

    /// Apply `change` to the current document under the store lock.
    ///
    /// `change` returns its result and whether the document must be written.
    /// Nothing is written when it fails.
    fn transact<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut SnapshotTable) -> Result<(T, bool)>,
    {
        std::fs::create_dir_all(self.directory())?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| self.lock_error(e))?;
        lock.lock_exclusive().map_err(|e| self.lock_error(e))?;

        let mut table = self.load()?;
        let (result, dirty) = change(&mut table)?;
        if dirty {
            self.persist(&table)?;
        }
        // Lock is released when `lock` is dropped
        Ok(result)
    }

    fn lock_error(&self, error: std::io::Error) -> StatsError {
        StatsError::repository_with_source(
            format!("Failed to lock snapshot store {}", self.lock_path.display()),
            error,
        )
    }

    fn persist(&self, table: &SnapshotTable) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&table.sorted())?;
        let mut file = tempfile::NamedTempFile::new_in(self.directory())?;
        file.write_all(&payload)?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| {
            StatsError::repository_with_source(
                format!("Failed to write snapshot store {}", self.path.display()),
                e.error,
            )
        })?;

        debug!(path = %self.path.display(), snapshots = table.len(), "Snapshot store written");
        Ok(())
    }
}

#[async_trait]
impl SnapshotRepository for FileSnapshotRepository {
    async fn exists(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool> {
        Ok(self.load()?.exists(snapshot_type, period))
    }

    async fn save(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.transact(|table| table.save(snapshot).map(|saved| (saved, true)))
    }

    async fn update(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.transact(|table| table.update(snapshot).map(|updated| (updated, true)))
    }

    async fn replace(&self, snapshot: Snapshot) -> Result<Option<Snapshot>> {
        self.transact(|table| Ok((table.replace(snapshot), true)))
    }

    async fn delete(&self, snapshot_type: SnapshotType, period: &Period) -> Result<bool> {
        self.transact(|table| {
            let removed = table.delete(snapshot_type, period);
            Ok((removed, removed))
        })
    }

    async fn find_by_type_and_period(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
    ) -> Result<Option<Snapshot>> {
        Ok(self.load()?.find(snapshot_type, period))
    }

    async fn find_by_type(&self, snapshot_type: SnapshotType) -> Result<Vec<Snapshot>> {
        Ok(self.load()?.find_by_type(snapshot_type))
    }

    async fn delete_expired_snapshots(&self, before: DateTime<Utc>) -> Result<u64> {
        self.transact(|table| {
            let removed = table.delete_expired(before);
            Ok((removed, removed > 0))
        })
    }
}
