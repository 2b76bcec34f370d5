//! Configuration management for the client.

use drift_engine::{
    CacheSizeConfig, EngineConfig, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_MAX_TRANSACTION_RETRIES,
};
use std::env;

/// Client configuration, usually loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Keep pending writes and the server cache in local storage
    pub persistence_enabled: bool,
    /// Budget for the stored server cache
    pub cache_size_bytes: u64,
    /// Retries after a stale transaction response
    pub max_transaction_retries: u32,
    /// Cancel older writes strictly below a new overwrite
    pub supersede_nested_writes: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            persistence_enabled: false,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_transaction_retries: DEFAULT_MAX_TRANSACTION_RETRIES,
            supersede_nested_writes: false,
        }
    }
}

impl ClientConfig {
    /// Load a `.env` file if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let persistence_enabled = match env::var("DRIFT_PERSISTENCE") {
            Ok(raw) => parse_flag("DRIFT_PERSISTENCE", &raw)?,
            Err(_) => defaults.persistence_enabled,
        };

        let cache_size_bytes = match env::var("DRIFT_CACHE_SIZE_BYTES") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber {
                var: "DRIFT_CACHE_SIZE_BYTES",
                value: raw,
            })?,
            Err(_) => defaults.cache_size_bytes,
        };

        let max_transaction_retries = match env::var("DRIFT_MAX_TRANSACTION_RETRIES") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber {
                var: "DRIFT_MAX_TRANSACTION_RETRIES",
                value: raw,
            })?,
            Err(_) => defaults.max_transaction_retries,
        };

        let supersede_nested_writes = match env::var("DRIFT_SUPERSEDE_NESTED_WRITES") {
            Ok(raw) => parse_flag("DRIFT_SUPERSEDE_NESTED_WRITES", &raw)?,
            Err(_) => defaults.supersede_nested_writes,
        };

        let config = Self {
            persistence_enabled,
            cache_size_bytes,
            max_transaction_retries,
            supersede_nested_writes,
        };
        config.cache_size()?;
        Ok(config)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_transaction_retries: self.max_transaction_retries,
            supersede_nested_writes: self.supersede_nested_writes,
        }
    }

    /// The validated cache-size setting.
    pub fn cache_size(&self) -> Result<CacheSizeConfig, ConfigError> {
        let mut cache_size = CacheSizeConfig::new();
        cache_size.set(self.cache_size_bytes)?;
        Ok(cache_size)
    }
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            var,
            value: raw.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a boolean, got '{value}'")]
    InvalidFlag { var: &'static str, value: String },

    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error(transparent)]
    Engine(#[from] drift_engine::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_engine::{MAX_CACHE_SIZE_BYTES, MIN_CACHE_SIZE_BYTES};

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(!config.persistence_enabled);
        assert_eq!(config.cache_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_flag_parsing() {
        assert!(parse_flag("X", "TRUE").unwrap());
        assert!(parse_flag("X", " on ").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(matches!(
            parse_flag("X", "maybe"),
            Err(ConfigError::InvalidFlag { var: "X", .. })
        ));
    }

    #[test]
    fn test_cache_size_validation() {
        let config = ClientConfig {
            cache_size_bytes: MIN_CACHE_SIZE_BYTES - 1,
            ..ClientConfig::default()
        };
        assert!(matches!(config.cache_size(), Err(ConfigError::Engine(_))));

        let config = ClientConfig {
            cache_size_bytes: MAX_CACHE_SIZE_BYTES,
            ..ClientConfig::default()
        };
        assert_eq!(config.cache_size().unwrap().bytes(), MAX_CACHE_SIZE_BYTES);
    }
}
