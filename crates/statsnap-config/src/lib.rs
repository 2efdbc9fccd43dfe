//! Configuration management for statsnap

pub mod loader;
pub mod settings;
pub mod validation;

pub use loader::{ConfigError, ConfigLoader, CONFIG_PATH_VAR};
pub use settings::{
    AppConfig, BackfillConfig, CacheSettings, LeaseConfig, LoggingSettings, SchedulingConfig,
    SnapshotConfig, StorageConfig,
};
