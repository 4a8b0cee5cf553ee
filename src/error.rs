//! Error types for the Tollgate enforcement core.

use thiserror::Error;

use crate::store::StoreError;
use crate::usage::resync::ResyncError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Control plane resync errors
    #[error("Resync error: {0}")]
    Resync(#[from] ResyncError),

    /// Policy or context payloads that failed to parse
    #[error("Invalid payload: {0}")]
    Payload(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for TollgateError {
    fn from(e: serde_json::Error) -> Self {
        TollgateError::Payload(e.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
