//! Common error types for Tessel.

use thiserror::Error;

/// Result type alias using Tessel's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Tessel applications.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Key material could not be parsed
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl Error {
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn invalid_key(msg: impl std::fmt::Display) -> Self {
        Self::InvalidKey(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
