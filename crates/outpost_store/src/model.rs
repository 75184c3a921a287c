//! Domain records held by the record store.

use crate::error::{StoreError, StoreResult};
use crate::types::{AnswerId, EventId, QuestionId, SessionId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An externally established identity, the input to authentication.
///
/// Produced by whatever provider authenticated the user; the store
/// upserts it into a [`User`] keyed by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable id assigned by the identity provider.
    pub external_id: String,
    /// Email address, unique per user.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Optional username.
    pub username: Option<String>,
    /// Optional avatar URL.
    pub avatar_url: Option<String>,
    /// How the identity was established (e.g. "google", "test").
    pub provider: String,
}

impl Identity {
    /// Validates the identity before any write.
    pub fn validate(&self) -> StoreResult<()> {
        if self.external_id.trim().is_empty() {
            return Err(StoreError::validation("external id is empty"));
        }
        if self.email.trim().is_empty() || !self.email.contains('@') {
            return Err(StoreError::validation(format!(
                "invalid email: {:?}",
                self.email
            )));
        }
        if self.provider.trim().is_empty() {
            return Err(StoreError::validation("provider is empty"));
        }
        Ok(())
    }
}

/// A stored user record.
///
/// Created on first successful authentication and updated, never
/// duplicated, on subsequent authentications with the same email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Store-assigned id.
    pub id: UserId,
    /// Provider-assigned external id.
    pub external_id: String,
    /// Email address (unique).
    pub email: String,
    /// Display name.
    pub name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Optional username.
    pub username: Option<String>,
    /// Optional avatar URL.
    pub avatar_url: Option<String>,
    /// Identity provider tag.
    pub provider: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

/// One continuous period of application use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Start time.
    pub started_at: Timestamp,
    /// End time; `None` while the session is active.
    pub ended_at: Option<Timestamp>,
    /// Free-form device/platform metadata.
    pub device: BTreeMap<String, String>,
    /// Application version string.
    pub app_version: String,
}

impl Session {
    /// Returns true while the session has no end time.
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A captured question. Immutable once created except for an attached
/// answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    /// Question id.
    pub id: QuestionId,
    /// Owning user.
    pub user_id: UserId,
    /// Owning session.
    pub session_id: SessionId,
    /// Question text.
    pub text: String,
    /// Optional kind tag, e.g. "text" or "image_ocr".
    pub kind: Option<String>,
    /// Optional raw input blob, e.g. an image payload.
    pub raw_input: Option<Vec<u8>>,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: Timestamp,
}

/// A generated answer, referencing exactly one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    /// Answer id.
    pub id: AnswerId,
    /// The question this answers (1:1).
    pub question_id: QuestionId,
    /// Answer text.
    pub text: String,
    /// Source/provider tag, e.g. "ollama" or "gemini".
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
    /// Processing duration in milliseconds.
    pub duration_ms: u64,
    /// Creation time.
    pub created_at: Timestamp,
}

/// A question together with its answer, if one has been attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    /// The question.
    pub question: QuestionRecord,
    /// The attached answer, if any.
    pub answer: Option<AnswerRecord>,
}

/// An append-only usage event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Event id.
    pub id: EventId,
    /// Owning user.
    pub user_id: UserId,
    /// Feature name, e.g. "screenshot".
    pub feature: String,
    /// Action name, e.g. "captured".
    pub action: String,
    /// Optional structured details.
    pub details: Option<serde_json::Value>,
    /// Event time.
    pub occurred_at: Timestamp,
}

/// A user's full dataset, aggregated in memory for the export formatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    /// The user record.
    pub user: User,
    /// All sessions, oldest first.
    pub sessions: Vec<Session>,
    /// All question/answer pairs, oldest first.
    pub questions: Vec<QuestionAnswer>,
    /// All usage events, oldest first.
    pub events: Vec<UsageEvent>,
}
