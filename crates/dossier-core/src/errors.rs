//! Engine error taxonomy.
//!
//! Validation and pending-dependency errors are recoverable by the immediate
//! caller. Tool failures are not errors at all: they resolve requests with
//! status `error` and flow back as data. `InvariantViolation` is fatal — it
//! means the versioning primitive or a storage constraint has been bypassed
//! and must never be swallowed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed input rejected before any state change.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {kind} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// `complete_move` called while a blocking tool request is unresolved.
    /// Never retried internally; the caller decides whether to poll or fail.
    #[error("move {move_event_id} has {pending} unresolved blocking request(s)")]
    PendingDependency {
        move_event_id: String,
        pending: usize,
    },

    /// A storage invariant no longer holds (e.g. two current frames for one
    /// logical key). Indicates a bug, not a runtime condition.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl LedgerError {
    /// True for transient storage contention worth a bounded retry
    /// (sequencing conflicts per the coordination layer's contract).
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Database(msg) => {
                msg.contains("database is locked")
                    || msg.contains("database is busy")
                    || msg.contains("UNIQUE constraint failed: move_events.run_id")
            }
            _ => false,
        }
    }
}
