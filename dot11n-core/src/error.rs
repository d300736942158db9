#![forbid(unsafe_code)]

//! Common error type for the dot11n crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Dot11nError {
    /// I/O related failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing failures.
    #[error("Config parse error: {0}")]
    ConfigParse(toml::de::Error),

    /// Filesystem watch errors.
    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    /// Configuration parsed but violates a cross-field constraint.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenient alias for results throughout the dot11n crates.
pub type Dot11nResult<T> = Result<T, Dot11nError>;
