//! Error types for the healing crate.
//!
//! Integration failures are not errors here: they are classified into
//! [`ErrorClassification`](crate::types::ErrorClassification) values and
//! handled by the engine. The enums below cover the crate's own plumbing.

use thiserror::Error;

/// Pattern store import/export failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// Logging bootstrap failures.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid logging configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to set global subscriber: {0}")]
    Subscriber(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
