//! Application configuration structures

use chrono::Duration;
use serde::{Deserialize, Serialize};
use statsnap_common::{LogFormat, LoggingConfig};
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    #[validate]
    pub storage: StorageConfig,

    #[validate]
    pub lease: LeaseConfig,

    #[validate]
    pub scheduling: SchedulingConfig,

    #[validate]
    pub backfill: BackfillConfig,

    #[validate]
    pub snapshots: SnapshotConfig,

    #[validate]
    pub cache: CacheSettings,

    #[validate]
    pub logging: LoggingSettings,
}

/// Where snapshots are persisted and activity records are read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the snapshot repository
    #[validate(custom(
        function = "crate::validation::validate_file_path",
        message = "Invalid snapshots path"
    ))]
    pub snapshots_path: String,

    /// JSON dump of post and user activity
    #[validate(custom(
        function = "crate::validation::validate_file_path",
        message = "Invalid activity path"
    ))]
    pub activity_path: String,
}

/// Execution lease settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LeaseConfig {
    /// Directory holding lease files
    #[validate(custom(
        function = "crate::validation::validate_file_path",
        message = "Invalid lease directory"
    ))]
    pub directory: String,

    /// Age after which a lease is reclaimed regardless of its owner; 0 disables
    pub max_age_secs: u64,
}

/// Scheduled run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Periods computed by `statsnap snapshot` when none are given
    #[validate(custom(
        function = "crate::validation::validate_periods",
        message = "Periods must be a non-empty list of daily, weekly, monthly"
    ))]
    pub periods: Vec<String>,

    #[validate(range(max = 10, message = "Max retries cannot exceed 10"))]
    pub max_retries: u32,

    /// Delay before retry `n` is `n` times this value
    #[validate(range(max = 60000, message = "Retry base delay cannot exceed 60000 ms"))]
    pub retry_base_delay_ms: u64,
}

/// Backfill defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BackfillConfig {
    #[validate(range(min = 1, max = 365, message = "Batch size must be between 1 and 365 days"))]
    pub default_batch_size: usize,

    /// Length of the range used when no dates are given
    #[validate(range(min = 1, max = 365, message = "Default days must be between 1 and 365"))]
    pub default_days: u32,
}

/// Snapshot content and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SnapshotConfig {
    #[validate(range(min = 1, message = "Snapshot TTL must be at least 1 day"))]
    pub ttl_days: u32,

    #[validate(range(min = 1, max = 100, message = "Popular limit must be between 1 and 100"))]
    pub popular_limit: usize,

    #[validate(range(min = 1, max = 100, message = "Most active limit must be between 1 and 100"))]
    pub most_active_limit: usize,
}

/// Read-through cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheSettings {
    #[validate(range(min = 1, message = "Cache capacity must be at least 1"))]
    pub max_capacity: u64,

    #[validate(range(
        min = 1,
        max = 86400,
        message = "Cache TTL must be between 1 and 86400 seconds"
    ))]
    pub ttl_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingSettings {
    #[validate(custom(
        function = "crate::validation::validate_log_level",
        message = "Log level must be one of: trace, debug, info, warn, error"
    ))]
    pub level: String,

    pub format: LogFormat,

    /// Log file path; stdout when unset
    pub file: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshots_path: "data/snapshots.json".to_string(),
            activity_path: "data/activity.json".to_string(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().to_string_lossy().into_owned(),
            max_age_secs: 6 * 3600,
        }
    }
}

impl LeaseConfig {
    pub fn max_age(&self) -> Option<Duration> {
        match self.max_age_secs {
            0 => None,
            secs => Some(Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            periods: vec!["daily".to_string()],
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl SchedulingConfig {
    pub fn retry_base_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 30,
            default_days: 30,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ttl_days: 90,
            popular_limit: 10,
            most_active_limit: 10,
        }
    }
}

impl SnapshotConfig {
    pub fn ttl(&self) -> Duration {
        Duration::days(i64::from(self.ttl_days))
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            ttl_secs: 3600,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LoggingSettings {
    /// Subscriber settings for `statsnap_common::init_logging`
    pub fn to_logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.level.clone(),
            format: self.format,
            file_path: self.file.clone(),
            ..LoggingConfig::default()
        }
    }
}
