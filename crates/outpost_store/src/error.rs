//! Error types for the record store.

use crate::types::{QuestionId, SessionId, UnitId, UserId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Input was rejected before any write happened.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// Referenced user does not exist.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// Referenced session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Referenced question does not exist.
    #[error("question not found: {0}")]
    QuestionNotFound(QuestionId),

    /// Referenced outbox unit does not exist.
    #[error("outbox unit not found: {0}")]
    UnitNotFound(UnitId),

    /// The durable store is closed; operations fail fast rather than
    /// buffering in memory.
    #[error("store unavailable")]
    Unavailable,
}

impl StoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}
