//! Error types shared by chain elements.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for chain element operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Errors returned by chain elements and monitoring sources.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    #[error("forward failed: {0}")]
    Forward(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("monitor error: {0}")]
    Monitor(String),

    #[error("operation canceled")]
    Canceled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
