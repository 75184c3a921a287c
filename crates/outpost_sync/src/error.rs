//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the delivery can be retried.
        retryable: bool,
    },

    /// The Portal explicitly rejected the payload; not retried, surfaced
    /// for operator review.
    #[error("portal rejected payload: {0}")]
    Rejected(String),

    /// The transmission timed out.
    #[error("transfer timed out")]
    Timeout,

    /// Record store error during sync.
    #[error("store error: {0}")]
    Store(#[from] outpost_store::StoreError),

    /// A sync cycle is already in progress.
    #[error("sync already in progress")]
    SyncInProgress,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the failed delivery can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Rejected(_) => false,
            SyncError::Store(_) => false,
            SyncError::SyncInProgress => false,
        }
    }
}
