//! Error types for the Drift engine.
//!
//! Only input and configuration problems surface as errors. Failures of
//! in-flight writes are reported through their completion instead.

use thiserror::Error;

/// All synchronous errors from the Drift engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Input validation errors
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // State errors
    #[error("invalid persisted state: {0}")]
    InvalidPersistedState(String),

    #[error("unknown registration: {0}")]
    UnknownRegistration(u64),
}

impl Error {
    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
