//! Integration tests for statsnap-config.

use statsnap_common::StatsError;
use statsnap_config::{AppConfig, ConfigError, ConfigLoader};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
storage:
  snapshots_path: /var/lib/statsnap/snapshots.json
  activity_path: /var/lib/statsnap/activity.json
lease:
  directory: /run/statsnap
  max_age_secs: 600
scheduling:
  periods: [daily, weekly, monthly]
  max_retries: 2
  retry_base_delay_ms: 250
backfill:
  default_batch_size: 7
  default_days: 14
snapshots:
  ttl_days: 30
  popular_limit: 5
  most_active_limit: 20
cache:
  max_capacity: 500
  ttl_secs: 60
logging:
  level: debug
  format: compact
"#,
    );

    let config = ConfigLoader::load_config(file.path()).unwrap();
    assert_eq!(config.lease.directory, "/run/statsnap");
    assert_eq!(config.scheduling.periods.len(), 3);
    assert_eq!(config.scheduling.retry_base_delay().as_millis(), 250);
    assert_eq!(config.backfill.default_batch_size, 7);
    assert_eq!(config.snapshots.popular_limit, 5);
    assert_eq!(config.cache.ttl().as_secs(), 60);
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("");
    let config = ConfigLoader::load_config(file.path()).unwrap();
    assert_eq!(config.backfill, AppConfig::default().backfill);
}

#[test]
fn test_invalid_values_are_rejected() {
    let result = ConfigLoader::from_yaml("backfill:\n  default_batch_size: 400\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));

    let result = ConfigLoader::from_yaml("scheduling:\n  periods: [hourly]\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));

    let result = ConfigLoader::from_yaml("logging:\n  format: xml\n");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_missing_file_converts_to_config_error() {
    let error = ConfigLoader::load_config("/nonexistent/statsnap.yaml").unwrap_err();
    assert!(matches!(error, ConfigError::Io { .. }));

    let error: StatsError = error.into();
    assert!(matches!(error, StatsError::Config { .. }));
    assert!(error.to_string().contains("/nonexistent/statsnap.yaml"));
}
