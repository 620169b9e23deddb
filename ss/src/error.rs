//! Store error types

use thiserror::Error;

/// Errors surfaced by the session store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is terminal, no further appends allowed")]
    SessionTerminal(String),

    #[error("Corrupt log line in {path} at line {line}: {reason}")]
    CorruptLog {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Check whether the error indicates a missing session rather than a
    /// storage fault
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::SessionNotFound(_))
    }
}
