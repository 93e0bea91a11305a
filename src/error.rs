use thiserror::Error;

/// Failure taxonomy for the recording/upload pipeline.
///
/// Only `Transport` is retryable, and only at the chunk level inside the
/// upload orchestrator. Everything else propagates to the session state
/// machine unchanged.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Missing auth, device registration, permission, or an invalid state
    /// transition. Never retried.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// The remote rejected a create/patch call. Halts the saga at the
    /// failing step.
    #[error("remote rejected request ({status}): {detail}")]
    Registration { status: u16, detail: String },

    /// Network-level failure. Retryable with bounded backoff at the chunk
    /// level only.
    #[error("transport error: {0}")]
    Transport(String),

    /// The acknowledged upload offset does not match what was sent. The
    /// transfer is corrupted; the upload intent must be abandoned.
    #[error("upload offset mismatch: sent up to {expected}, remote acknowledged {acknowledged}")]
    Protocol { expected: u64, acknowledged: u64 },

    /// The artifact is unusable (missing, unreadable, zero-length). Never
    /// retried.
    #[error("invalid artifact: {0}")]
    Validation(String),
}

impl SyncError {
    /// Whether the upload orchestrator may retry the same chunk.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}
