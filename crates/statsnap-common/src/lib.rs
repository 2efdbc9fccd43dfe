//! Common utilities and types for statsnap

pub mod error;
pub mod logging;
pub mod utils;

// Re-export commonly used types
pub use error::{Result, StatsError};
pub use logging::{init_logging, LogFormat, LoggingConfig};
