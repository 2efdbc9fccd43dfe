//! Custom field validators

use validator::ValidationError;

const PERIODS: [&str; 3] = ["daily", "weekly", "monthly"];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Non-empty list of known period names
pub fn validate_periods(periods: &[String]) -> Result<(), ValidationError> {
    if periods.is_empty() {
        return Err(ValidationError::new("empty_periods"));
    }
    if periods
        .iter()
        .any(|period| !PERIODS.contains(&period.trim().to_ascii_lowercase().as_str()))
    {
        return Err(ValidationError::new("unsupported_period"));
    }
    Ok(())
}

/// A bare level, or an `EnvFilter` directive list such as `info,statsnap_jobs=debug`
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = !level.trim().is_empty()
        && level.split(',').all(|directive| {
            let level = directive.rsplit('=').next().unwrap_or_default();
            LOG_LEVELS.contains(&level.trim().to_ascii_lowercase().as_str())
        });
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Basic check for characters most filesystems reject
pub fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.trim().is_empty() {
        return Err(ValidationError::new("empty_file_path"));
    }

    let invalid_chars = ['<', '>', '"', '|', '?', '*'];
    if path.chars().any(|c| invalid_chars.contains(&c)) {
        return Err(ValidationError::new("invalid_file_path_characters"));
    }

    Ok(())
}
