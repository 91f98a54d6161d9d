//! Error types for the session engine.
//!
//! Store adapters produce [`StoreError`] and are the only place where a
//! failure is classified as transient or permanent. The session service maps
//! those into [`SessionError`] after the retry policy has run.

use thiserror::Error;

/// Failure reported by a [`crate::session_db::SessionStore`] adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),

    /// Retryable: timeouts, busy/locked database, store unreachable.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Not retryable: permission, malformed key, corrupt document.
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Transient(_) => "transient",
            StoreError::Permanent(_) => "permanent",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Permanent(format!("document encoding: {}", err))
    }
}

/// Error surfaced to callers of [`crate::SessionService`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    /// Retry budget exhausted while connectivity was reported up.
    #[error("store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("store rejected the operation: {0}")]
    PermanentStore(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("score worker is not running")]
    WorkerStopped,
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SessionError::NotFound(id),
            StoreError::Transient(msg) => SessionError::TransientStore(msg),
            StoreError::Permanent(msg) => SessionError::PermanentStore(msg),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A specialized `Result` type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
