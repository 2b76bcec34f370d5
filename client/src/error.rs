//! Error types for the client.

use crate::config::ConfigError;

/// Errors returned by [`crate::Database`] calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("engine error: {0}")]
    Engine(#[from] drift_engine::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid value: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker task has stopped; no further calls can succeed
    #[error("database is closed")]
    Closed,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
