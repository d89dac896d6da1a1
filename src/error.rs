//! Error types for the response cache

use std::path::PathBuf;
use std::result::Result as StdResult;
use std::io;

use thiserror::Error;

pub type Result<T> = StdResult<T, CacheError>;

/// Errors raised by the cache.
///
/// Only [`CacheError::Validation`] is meant to reach the calling workflow.
/// Everything else is recovered inside the cache, which always degrades to
/// "treat as a full miss".
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("Semantic capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),
}

impl CacheError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Whether the cache handles this error itself instead of surfacing it.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Config(_))
    }
}
