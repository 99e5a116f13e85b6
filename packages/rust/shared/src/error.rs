//! Error types for KnowledgeForge.
//!
//! Library crates use [`KnowledgeForgeError`] via `thiserror`. Expected
//! pipeline outcomes (commit conflicts, schema rejections, failed runs,
//! rollbacks) are modelled as values, not as errors.

use std::path::PathBuf;

/// Top-level error type for all KnowledgeForge operations.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Reasoning service call failed (HTTP, backend, or response decoding).
    #[error("reasoning error: {message}")]
    Reasoning { message: String, transient: bool },

    /// An operation exceeded its deadline.
    #[error("timed out after {after_ms}ms: {operation}")]
    Timeout { operation: String, after_ms: u64 },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON/TOML (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Cooperative cancellation was observed.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KnowledgeForgeError>;

impl KnowledgeForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// A reasoning failure worth retrying (network hiccup, 5xx, rate limit).
    pub fn reasoning_transient(msg: impl Into<String>) -> Self {
        Self::Reasoning {
            message: msg.into(),
            transient: true,
        }
    }

    /// A reasoning failure that will not go away on retry (bad request, undecodable body).
    pub fn reasoning_fatal(msg: impl Into<String>) -> Self {
        Self::Reasoning {
            message: msg.into(),
            transient: false,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reasoning { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for KnowledgeForgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
