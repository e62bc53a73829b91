//! Error types surfaced by the state manager and its collaborators.
//!
//! Per the error-handling design: precondition violations and illegal
//! lifecycle use are programmer errors and `panic!`/`assert!` rather than
//! flow through `Result`. `StateManagerError` is reserved for the
//! user-facing "Update error" family plus store failures, which propagate
//! verbatim from the backing store.

/// Errors a [`crate::manager::StateManager`] can return to a caller.
#[derive(thiserror::Error, Debug)]
pub enum StateManagerError {
    /// `registerUpdate` was called for a (role, job) with no active tasks.
    #[error("No active tasks for job {role}/{job}")]
    NoActiveTasks { role: String, job: String },

    /// `registerUpdate` was called while an update is already registered
    /// for the same (role, job).
    #[error("Update already in progress for {role}/{job}")]
    UpdateAlreadyInProgress { role: String, job: String },

    /// `finishUpdate` was called but no update exists for the (role, job).
    #[error("Update does not exist for {role}/{job}")]
    UpdateNotFound { role: String, job: String },

    /// `finishUpdate` was called with a token that does not match the
    /// currently registered update.
    #[error("Update token mismatch for {role}/{job}")]
    UpdateTokenMismatch { role: String, job: String },

    /// The backing store reported a failure. Propagated verbatim; the
    /// envelope has already aborted the enclosing transaction and dropped
    /// any pending side effects by the time this is observed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result alias used throughout the state manager.
pub type Result<T> = std::result::Result<T, StateManagerError>;
