//! Error types and utilities for statsnap

use thiserror::Error;

/// Result type alias for statsnap operations
pub type Result<T> = std::result::Result<T, StatsError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for statsnap operations
#[derive(Error, Debug)]
pub enum StatsError {
    /// Validation errors for user input or data
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// A period granularity outside of daily/weekly/monthly was requested
    #[error("Unsupported period '{period}', expected one of: daily, weekly, monthly")]
    UnsupportedPeriod { period: String },

    /// One or more snapshot types are not known
    #[error("Invalid snapshot type(s): {}", .types.join(", "))]
    InvalidSnapshotType { types: Vec<String> },

    /// Several independent argument checks failed at once
    #[error("Invalid arguments: {}", .errors.join("; "))]
    InvalidArguments { errors: Vec<String> },

    /// A snapshot for the same type and period is already stored
    #[error("Snapshot {snapshot_type} already exists for period {period}")]
    DuplicateSnapshot {
        snapshot_type: String,
        period: String,
    },

    /// The data source has nothing recorded for the requested period
    #[error("No {snapshot_type} data available for period {period}")]
    NoDataForPeriod {
        snapshot_type: String,
        period: String,
    },

    /// Snapshot is past its expiry and can no longer be written
    #[error("Snapshot {id} expired and is read-only")]
    ExpiredSnapshot { id: String },

    /// Stored statistics no longer match the snapshot's checksum or shape
    #[error("Snapshot {id} failed integrity validation: {message}")]
    Integrity { id: String, message: String },

    /// No snapshot is stored for the given type and period
    #[error("Snapshot {snapshot_type} not found for period {period}")]
    SnapshotNotFound {
        snapshot_type: String,
        period: String,
    },

    /// Another live process holds the execution lease
    #[error("Concurrent execution detected: lease {lease_key} is held by process {owner_pid}")]
    ConcurrentExecution { lease_key: String, owner_pid: u32 },

    /// Lease store failures
    #[error("Lease error: {message}")]
    Lease {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Statistics data source failures
    #[error("Data source error: {message}")]
    DataSource {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Snapshot repository failures
    #[error("Repository error: {message}")]
    Repository {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Cache failures
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with custom message
    #[error("{message}")]
    Generic {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
}

impl StatsError {
    /// Create a new generic error with a custom message
    pub fn new(msg: impl Into<String>) -> Self {
        Self::Generic {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a new generic error with a custom message and source
    pub fn with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Generic {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a new validation error with field name
    pub fn validation_field(msg: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    pub fn duplicate(snapshot_type: impl ToString, period: impl ToString) -> Self {
        Self::DuplicateSnapshot {
            snapshot_type: snapshot_type.to_string(),
            period: period.to_string(),
        }
    }

    pub fn no_data(snapshot_type: impl ToString, period: impl ToString) -> Self {
        Self::NoDataForPeriod {
            snapshot_type: snapshot_type.to_string(),
            period: period.to_string(),
        }
    }

    pub fn not_found(snapshot_type: impl ToString, period: impl ToString) -> Self {
        Self::SnapshotNotFound {
            snapshot_type: snapshot_type.to_string(),
            period: period.to_string(),
        }
    }

    /// Create a new lease error
    pub fn lease(msg: impl Into<String>) -> Self {
        Self::Lease {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a new lease error with source
    pub fn lease_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Lease {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new data source error
    pub fn data_source(msg: impl Into<String>) -> Self {
        Self::DataSource {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a new data source error with source
    pub fn data_source_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DataSource {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new repository error
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a new repository error with source
    pub fn repository_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Repository {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new cache error
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache {
            message: msg.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a new configuration error with source
    pub fn config_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the error was raised by input validation before any work started
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::UnsupportedPeriod { .. }
                | Self::InvalidSnapshotType { .. }
                | Self::InvalidArguments { .. }
        )
    }

    /// Whether repeating the same operation could succeed.
    ///
    /// Guard failures (duplicates, missing data, expiry, integrity, validation) are
    /// deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DataSource { .. }
            | Self::Repository { .. }
            | Self::Cache { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Generic { .. } => true,
            Self::Validation { .. }
            | Self::UnsupportedPeriod { .. }
            | Self::InvalidSnapshotType { .. }
            | Self::InvalidArguments { .. }
            | Self::DuplicateSnapshot { .. }
            | Self::NoDataForPeriod { .. }
            | Self::ExpiredSnapshot { .. }
            | Self::Integrity { .. }
            | Self::SnapshotNotFound { .. }
            | Self::ConcurrentExecution { .. }
            | Self::Lease { .. }
            | Self::Config { .. } => false,
        }
    }
}

impl From<serde_yaml::Error> for StatsError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::config_with_source("YAML parsing error", err)
    }
}
