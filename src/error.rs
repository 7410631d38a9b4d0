//! Error types for the Windgate crate.

use thiserror::Error;

/// Main error type for Windgate operations.
#[derive(Error, Debug)]
pub enum WindgateError {
    /// Limiter settings that can never be valid (zero limit, zero window)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file or environment could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// The window store could not be reached or timed out
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for WindgateError {
    fn from(err: redis::RedisError) -> Self {
        WindgateError::StoreUnavailable(err.to_string())
    }
}

impl From<::config::ConfigError> for WindgateError {
    fn from(err: ::config::ConfigError) -> Self {
        WindgateError::Config(err.to_string())
    }
}

impl WindgateError {
    /// Whether the error came from the window store rather than from setup.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, WindgateError::StoreUnavailable(_))
    }
}

/// Result type alias for Windgate operations.
pub type Result<T> = std::result::Result<T, WindgateError>;
