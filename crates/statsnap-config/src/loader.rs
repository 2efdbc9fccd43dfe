//! Configuration loading utilities

use statsnap_common::StatsError;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};
use validator::Validate;

use crate::settings::AppConfig;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_VAR: &str = "STATSNAP_CONFIG_PATH";

const DEFAULT_FILES: [&str; 2] = ["statsnap.yaml", "statsnap.yml"];

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error when reading configuration file
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parsing error
    #[error("Failed to parse YAML configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Configuration validation error
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Environment variable parsing error
    #[error("Failed to parse environment variable '{var}': {message}")]
    EnvParse { var: String, message: String },
}

impl From<ConfigError> for StatsError {
    fn from(err: ConfigError) -> Self {
        StatsError::config_with_source(err.to_string(), err)
    }
}

/// Configuration loader for the application
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `STATSNAP_CONFIG_PATH`, else `statsnap.yaml` / `statsnap.yml`
    /// in the working directory, else defaults. Environment overrides apply in
    /// every case.
    pub fn load() -> Result<AppConfig, ConfigError> {
        if let Ok(path) = env::var(CONFIG_PATH_VAR) {
            return Self::load_config(path);
        }
        match DEFAULT_FILES.iter().map(Path::new).find(|path| path.exists()) {
            Some(path) => Self::load_config(path),
            None => {
                debug!("No configuration file found, using defaults");
                Self::finish(AppConfig::default(), |key| env::var(key).ok())
            }
        }
    }

    /// Load a specific YAML file with environment overrides
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
        let config = Self::read_file(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Loaded configuration");
        Self::finish(config, |key| env::var(key).ok())
    }

    /// Parse YAML text without consulting the environment
    pub fn from_yaml(contents: &str) -> Result<AppConfig, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<AppConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // An empty file is a valid, all-defaults configuration
        if contents.trim().is_empty() {
            return Ok(AppConfig::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    fn finish<F>(mut config: AppConfig, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::apply_overrides(&mut config, lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STATSNAP_*` overrides read through `lookup`
    pub fn apply_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("STATSNAP_SNAPSHOTS_PATH") {
            config.storage.snapshots_path = path;
        }
        if let Some(path) = lookup("STATSNAP_ACTIVITY_PATH") {
            config.storage.activity_path = path;
        }

        if let Some(directory) = lookup("STATSNAP_LEASE_DIR") {
            config.lease.directory = directory;
        }
        parse_into(&lookup, "STATSNAP_LEASE_MAX_AGE_SECS", &mut config.lease.max_age_secs)?;

        if let Some(periods) = lookup("STATSNAP_PERIODS") {
            config.scheduling.periods = periods
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        parse_into(&lookup, "STATSNAP_MAX_RETRIES", &mut config.scheduling.max_retries)?;
        parse_into(
            &lookup,
            "STATSNAP_RETRY_BASE_DELAY_MS",
            &mut config.scheduling.retry_base_delay_ms,
        )?;

        parse_into(
            &lookup,
            "STATSNAP_BACKFILL_BATCH_SIZE",
            &mut config.backfill.default_batch_size,
        )?;
        parse_into(&lookup, "STATSNAP_BACKFILL_DAYS", &mut config.backfill.default_days)?;

        parse_into(&lookup, "STATSNAP_SNAPSHOT_TTL_DAYS", &mut config.snapshots.ttl_days)?;
        parse_into(&lookup, "STATSNAP_CACHE_CAPACITY", &mut config.cache.max_capacity)?;
        parse_into(&lookup, "STATSNAP_CACHE_TTL_SECS", &mut config.cache.ttl_secs)?;

        if let Some(level) = lookup("STATSNAP_LOG_LEVEL") {
            config.logging.level = level;
        }
        parse_into(&lookup, "STATSNAP_LOG_FORMAT", &mut config.logging.format)?;
        if let Some(file) = lookup("STATSNAP_LOG_FILE") {
            config.logging.file = Some(file).filter(|file| !file.trim().is_empty());
        }

        Ok(())
    }
}

fn parse_into<F, T>(lookup: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(var) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::EnvParse {
            var: var.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}
