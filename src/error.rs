//! Error types for the rate limiting core.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Invalid settings or rule definitions, raised at load time
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not complete an increment
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Whether this error came from the counter store rather than from
    /// configuration. Callers apply their fail-open / fail-closed policy here.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, WardenError::Store(_))
    }
}

/// Result type alias for ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
