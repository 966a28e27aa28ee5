//! Error types for Ratewarden.

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or failed to answer.
    ///
    /// Connection failures, protocol errors, script failures and client
    /// timeouts all collapse into this one kind.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatewardenError {
    /// Whether this error came from the counter store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RatewardenError::StoreUnavailable(_))
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
