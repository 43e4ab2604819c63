//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("invalid worker bounds: min_workers {min} > max_workers {max}")]
    InvalidBounds { min: u32, max: u32 },

    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
