//! Error types for configuration management

use outbox_types::Error as OutboxError;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing a configuration file failed
    #[error("I/O error on config file '{path}': {source}")]
    Io {
        /// Configuration file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A setting breaks a cross-field rule
    #[error("Configuration validation failed: {message}")]
    Validation {
        /// What is wrong
        message: String,
    },

    /// A single setting holds a value it cannot take
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// Dotted key, e.g. `policy.disabled`
        key: String,
        /// What is wrong
        message: String,
    },

    /// A failure override names a backend error code that does not exist
    #[error("Unknown backend error code '{code}' in sync.failure_overrides")]
    UnknownErrorCode {
        /// Code as written
        code: String,
    },

    /// Encoding configuration as YAML, TOML or JSON failed
    #[error("Failed to write {format} configuration: {message}")]
    Encode {
        /// Target format
        format: &'static str,
        /// Encoder message
        message: String,
    },

    /// Layering sources (defaults, file, environment) failed
    #[error("Failed to merge configuration sources: {0}")]
    Source(#[from] config::ConfigError),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Encode {
            format: "YAML",
            message: error.to_string(),
        }
    }
}

impl From<ConfigError> for OutboxError {
    fn from(error: ConfigError) -> Self {
        OutboxError::config(error.to_string())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Cross-field validation failure
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Invalid value for `key`
    pub fn invalid_value<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Dotted key the error points at, when there is one
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::InvalidValue { key, .. } => Some(key),
            Self::UnknownErrorCode { .. } => Some("sync.failure_overrides"),
            _ => None,
        }
    }
}
