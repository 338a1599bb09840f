//! Error types for regwatch.
//!
//! Library crates use [`RegwatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Sub-kind of a transient infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    RateLimited,
    BotChallenge,
    StorageUnavailable,
    Network,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::BotChallenge => "bot_challenge",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Network => "network",
        }
    }
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for all regwatch operations.
#[derive(Debug, thiserror::Error)]
pub enum RegwatchError {
    /// Fetch or parse failure scoped to one source.
    #[error("adapter error ({source_code}): {message}")]
    Adapter {
        source_code: String,
        message: String,
    },

    /// Malformed candidate or insight. Never retried.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Timeout, rate limit, bot challenge or unavailable storage. Retried with backoff.
    #[error("transient {kind} error: {message}")]
    Transient {
        kind: TransientKind,
        message: String,
    },

    /// Remote analysis failure.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Two writers raced for the same identity and the lock could not be taken.
    #[error("concurrent write conflict on {identity}")]
    Conflict { identity: String },

    /// Database or file store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A state change outside the allowed transition table.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A run, record or stage that does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RegwatchError>;

impl RegwatchError {
    pub fn adapter(source_code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Adapter {
            source_code: source_code.into(),
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn transient(kind: TransientKind, msg: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::transient(TransientKind::Timeout, msg)
    }

    pub fn storage_unavailable(msg: impl Into<String>) -> Self {
        Self::transient(TransientKind::StorageUnavailable, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the central retry policy should try this again.
    ///
    /// Enrichment failures are retryable per the collaborator contract.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Enrichment(_))
    }
}
