//! Error types for the fleet ledger.
//!
//! Callers branch on the variant:
//! `RecordInsertConflict` means "re-read and retry", `RequestInvalid`
//! is never retried, the rest are surfaced unchanged.

use thiserror::Error;

/// Result type alias for ledger and repository operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Malformed input or an illegal state transition.
    #[error("request invalid: {0}")]
    RequestInvalid(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// Version mismatch on update, duplicate unique key on insert, or a
    /// record that vanished between read and write.
    #[error("record insert conflict: {0}")]
    RecordInsertConflict(String),

    /// Opaque lower-layer failure (redb, serialization).
    #[error("repository internal error: {0}")]
    RepositoryInternal(String),
}

impl StateError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::RequestInvalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::RecordNotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::RecordInsertConflict(msg.into())
    }

    /// Whether re-reading and retrying the logical operation can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RecordInsertConflict(_))
    }
}
