//! Crash-safe execution lease
//!
//! A lease marks one scheduled run for a given set of periods. The record
//! names its owning process so that a lease abandoned by a crashed process can
//! be reclaimed by the next run, either because the owner is gone or because
//! the lease outlived its maximum age.

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use statsnap_common::{Result, StatsError};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Contents of a lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
    pub periods: Vec<String>,
    pub hostname: String,
}

/// Lease key for a set of period names: MD5 of the sorted, de-duplicated names
pub fn lease_key<S: AsRef<str>>(periods: &[S]) -> String {
    let mut names: Vec<&str> = periods.iter().map(|name| name.as_ref()).collect();
    names.sort_unstable();
    names.dedup();
    format!("{:x}", md5::compute(names.join(",")))
}

/// Answers whether a process id still refers to a running process
pub trait ProcessLivenessChecker: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness via `/proc/<pid>`.
///
/// Where the proc filesystem is unavailable every owner is assumed alive and
/// stale leases are only reclaimed through their maximum age.
#[derive(Debug, Clone)]
pub struct ProcfsLivenessChecker {
    root: PathBuf,
}

impl Default for ProcfsLivenessChecker {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcfsLivenessChecker {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessLivenessChecker for ProcfsLivenessChecker {
    fn is_alive(&self, pid: u32) -> bool {
        if !self.root.is_dir() {
            return true;
        }
        self.root.join(pid.to_string()).exists()
    }
}

/// What a lease store holds for a key
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseEntry {
    Vacant,
    Held(LeaseRecord),
    /// Present but not a valid record
    Unreadable { modified_at: DateTime<Utc> },
}

/// Storage for lease records
pub trait LeaseStore: Send + Sync {
    /// Atomically create the lease; `false` if one already exists
    fn try_create(&self, key: &str, record: &LeaseRecord) -> Result<bool>;

    fn inspect(&self, key: &str) -> Result<LeaseEntry>;

    /// Remove the lease only while it is still `seen`; `false` if it changed
    fn remove_if(&self, key: &str, seen: &LeaseEntry) -> Result<bool>;

    /// Current record, `None` if absent or unreadable
    fn read(&self, key: &str) -> Result<Option<LeaseRecord>> {
        Ok(match self.inspect(key)? {
            LeaseEntry::Held(record) => Some(record),
            LeaseEntry::Vacant | LeaseEntry::Unreadable { .. } => None,
        })
    }
}

/// Lease files `statsnap-<key>.lease` in one directory.
///
/// Creation and removal hold an exclusive lock on `statsnap-<key>.lock`; the
/// lease itself is written to a temporary file and linked into place, so it
/// is never observed half written.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    directory: PathBuf,
}

impl FileLeaseStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| {
            StatsError::lease_with_source(
                format!("Failed to create lease directory {}", directory.display()),
                e,
            )
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(format!("statsnap-{}.lease", key))
    }

    fn lock(&self, key: &str) -> Result<File> {
        let path = self.directory.join(format!("statsnap-{}.lock", key));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .and_then(|file| file.lock_exclusive().map(|_| file))
            .map_err(|e| {
                StatsError::lease_with_source(format!("Failed to lock {}", path.display()), e)
            })?;
        Ok(file)
    }

    fn inspect_path(&self, path: &Path) -> Result<LeaseEntry> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LeaseEntry::Vacant),
            Err(e) => {
                return Err(StatsError::lease_with_source(
                    format!("Failed to read lease {}", path.display()),
                    e,
                ))
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(record) => Ok(LeaseEntry::Held(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable lease file");
                let modified_at = fs::metadata(path)
                    .and_then(|metadata| metadata.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(LeaseEntry::Unreadable { modified_at })
            }
        }
    }
}

impl LeaseStore for FileLeaseStore {
    fn try_create(&self, key: &str, record: &LeaseRecord) -> Result<bool> {
        let path = self.path_for(key);
        let _lock = self.lock(key)?;
        if path.exists() {
            return Ok(false);
        }

        let write_error = |e: std::io::Error| {
            StatsError::lease_with_source(format!("Failed to write lease {}", path.display()), e)
        };
        let mut file = NamedTempFile::new_in(&self.directory).map_err(write_error)?;
        let contents = serde_json::to_vec_pretty(record)?;
        file.write_all(&contents).map_err(write_error)?;
        file.as_file().sync_all().map_err(write_error)?;

        match file.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(write_error(e.error)),
        }
    }

    fn inspect(&self, key: &str) -> Result<LeaseEntry> {
        self.inspect_path(&self.path_for(key))
    }

    fn remove_if(&self, key: &str, seen: &LeaseEntry) -> Result<bool> {
        let path = self.path_for(key);
        let _lock = self.lock(key)?;
        let current = self.inspect_path(&path)?;
        if current != *seen {
            return Ok(false);
        }
        if current == LeaseEntry::Vacant {
            return Ok(true);
        }

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(StatsError::lease_with_source(
                format!("Failed to remove lease {}", path.display()),
                e,
            )),
        }
    }
}

/// Process-local lease store
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn try_create(&self, key: &str, record: &LeaseRecord) -> Result<bool> {
        let mut leases = self.leases.lock();
        if leases.contains_key(key) {
            return Ok(false);
        }
        leases.insert(key.to_string(), record.clone());
        Ok(true)
    }

    fn inspect(&self, key: &str) -> Result<LeaseEntry> {
        Ok(match self.leases.lock().get(key) {
            Some(record) => LeaseEntry::Held(record.clone()),
            None => LeaseEntry::Vacant,
        })
    }

    fn remove_if(&self, key: &str, seen: &LeaseEntry) -> Result<bool> {
        let mut leases = self.leases.lock();
        match (leases.get(key), seen) {
            (None, LeaseEntry::Vacant) => Ok(true),
            (Some(current), LeaseEntry::Held(expected)) if current == expected => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Attempts at taking a lease before giving up on a contended key
const ACQUIRE_ATTEMPTS: usize = 3;

/// How long an unreadable lease file counts as held
pub const DEFAULT_UNREADABLE_GRACE_SECS: i64 = 30;

/// Hands out leases, reclaiming those left behind by dead or stale owners
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    liveness: Arc<dyn ProcessLivenessChecker>,
    max_age: Option<Duration>,
    unreadable_grace: Duration,
    hostname: String,
}

impl LeaseManager {
    /// `max_age` of `None` disables the age check
    pub fn new(
        store: Arc<dyn LeaseStore>,
        liveness: Arc<dyn ProcessLivenessChecker>,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            store,
            liveness,
            max_age,
            unreadable_grace: Duration::seconds(DEFAULT_UNREADABLE_GRACE_SECS),
            hostname: local_hostname(),
        }
    }

    pub fn with_unreadable_grace(mut self, grace: Duration) -> Self {
        self.unreadable_grace = grace;
        self
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Take the lease for `periods`, failing with `ConcurrentExecution` if a
    /// live owner holds it.
    pub fn acquire<S: AsRef<str>>(&self, periods: &[S], now: DateTime<Utc>) -> Result<LeaseGuard> {
        let key = lease_key(periods);
        let mut names: Vec<String> = periods.iter().map(|name| name.as_ref().to_string()).collect();
        names.sort();
        names.dedup();

        let record = LeaseRecord {
            owner_pid: std::process::id(),
            started_at: now,
            periods: names,
            hostname: self.hostname.clone(),
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            if self.store.try_create(&key, &record)? {
                debug!(lease_key = %key, "Lease acquired");
                return Ok(LeaseGuard {
                    store: Arc::clone(&self.store),
                    key,
                    record,
                    released: false,
                });
            }

            let entry = self.store.inspect(&key)?;
            match &entry {
                LeaseEntry::Vacant => continue,
                LeaseEntry::Held(existing) if self.is_held(existing, now) => {
                    return Err(StatsError::ConcurrentExecution {
                        lease_key: key,
                        owner_pid: existing.owner_pid,
                    });
                }
                LeaseEntry::Held(existing) => {
                    warn!(
                        lease_key = %key,
                        owner_pid = existing.owner_pid,
                        owner_host = %existing.hostname,
                        started_at = %existing.started_at,
                        "Reclaiming abandoned lease"
                    );
                }
                // File clock, not the run clock
                LeaseEntry::Unreadable { modified_at }
                    if Utc::now() - *modified_at < self.unreadable_grace =>
                {
                    return Err(StatsError::ConcurrentExecution {
                        lease_key: key,
                        owner_pid: 0,
                    });
                }
                LeaseEntry::Unreadable { .. } => {
                    warn!(lease_key = %key, "Reclaiming unreadable lease");
                }
            }

            if !self.store.remove_if(&key, &entry)? {
                debug!(lease_key = %key, "Lease changed while reclaiming");
            }
        }

        let owner_pid = self
            .store
            .read(&key)?
            .map(|existing| existing.owner_pid)
            .unwrap_or_default();
        Err(StatsError::ConcurrentExecution {
            lease_key: key,
            owner_pid,
        })
    }

    /// Pids of owners on other hosts mean nothing here; those only lapse through `max_age`.
    fn is_held(&self, record: &LeaseRecord, now: DateTime<Utc>) -> bool {
        let expired = self
            .max_age
            .map(|max_age| now - record.started_at > max_age)
            .unwrap_or(false);
        if expired {
            return false;
        }
        record.hostname != self.hostname || self.liveness.is_alive(record.owner_pid)
    }
}

/// Held lease; released explicitly or when dropped
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    key: String,
    record: LeaseRecord,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove()?;
        info!(lease_key = %self.key, "Lease released");
        Ok(())
    }

    /// Leaves a lease alone that another run reclaimed in the meantime
    fn remove(&self) -> Result<()> {
        let ours = LeaseEntry::Held(self.record.clone());
        if !self.store.remove_if(&self.key, &ours)? {
            warn!(lease_key = %self.key, "Lease was taken over before release");
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove() {
            warn!(lease_key = %self.key, error = %e, "Failed to release lease on drop");
        }
    }
}

/// Host name recorded in leases: `HOSTNAME`, else `/etc/hostname`, else `unknown`
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
