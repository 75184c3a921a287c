//! The record store: durable local storage of users, sessions,
//! question/answer records, and usage events.
//!
//! Every mutating call appends (or coalesces into) exactly one outbox
//! unit under the same lock that covers the domain write, so the two are
//! atomic as a unit. Reads never touch the outbox.

use crate::error::{StoreError, StoreResult};
use crate::model::{
    AnswerRecord, Identity, QuestionAnswer, QuestionRecord, Session, UsageEvent, User, UserSnapshot,
};
use crate::outbox::{OutboxPayload, OutboxQueue, OutboxUnit};
use crate::types::{AnswerId, EventId, QuestionId, SessionId, Timestamp, UnitId, UserId};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Default)]
struct StoreInner {
    users: Vec<User>,
    sessions: Vec<Session>,
    questions: Vec<QuestionRecord>,
    answers: Vec<AnswerRecord>,
    events: Vec<UsageEvent>,
    outbox: OutboxQueue,
    closed: bool,
}

impl StoreInner {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn user(&self, id: UserId) -> StoreResult<&User> {
        self.users
            .iter()
            .find(|u| u.id == id)
            .ok_or(StoreError::UserNotFound(id))
    }

    fn session_mut(&mut self, id: SessionId) -> StoreResult<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::SessionNotFound(id))
    }

    /// Stamps the session ended (if still active) and enqueues its
    /// session-end unit, dependent on the session-start unit.
    fn end_session_inner(&mut self, session_id: SessionId, now: Timestamp) -> StoreResult<()> {
        let session = self.session_mut(session_id)?;
        if session.ended_at.is_some() {
            return Ok(());
        }
        session.ended_at = Some(now);
        let user_id = session.user_id;
        let depends_on = self.outbox.unit_for_session_start(session_id);
        self.outbox.enqueue(
            user_id,
            OutboxPayload::SessionEnd {
                session_id,
                ended_at: now,
            },
            depends_on,
            now,
        );
        Ok(())
    }

    fn snapshot(&self, user_id: UserId) -> StoreResult<UserSnapshot> {
        let user = self.user(user_id)?.clone();
        let sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        let questions: Vec<QuestionAnswer> = self
            .questions
            .iter()
            .filter(|q| q.user_id == user_id)
            .map(|q| QuestionAnswer {
                question: q.clone(),
                answer: self
                    .answers
                    .iter()
                    .find(|a| a.question_id == q.id)
                    .cloned(),
            })
            .collect();
        let events: Vec<UsageEvent> = self
            .events
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        Ok(UserSnapshot {
            user,
            sessions,
            questions,
            events,
        })
    }
}

/// Durable local store of domain records with an attached outbox.
///
/// The single writer lock serializes all mutating calls, which trivially
/// satisfies per-user write serialization and keeps per-user sequence
/// numbers in enqueue order.
#[derive(Debug, Default)]
pub struct RecordStore {
    inner: RwLock<StoreInner>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the store. All subsequent operations fail fast with
    /// [`StoreError::Unavailable`]; nothing is buffered in memory only.
    pub fn close(&self) {
        self.inner.write().closed = true;
    }

    /// Creates or updates a user, matching by email.
    ///
    /// Mutable fields (names, username, avatar) are updated in place on
    /// re-authentication; the same email never yields two records. No
    /// outbox unit of its own — the profile rides in the next
    /// session-start unit.
    pub fn upsert_user(&self, identity: &Identity) -> StoreResult<User> {
        identity.validate()?;
        let mut inner = self.inner.write();
        inner.check_open()?;
        let now = Utc::now();

        if let Some(user) = inner.users.iter_mut().find(|u| u.email == identity.email) {
            user.external_id = identity.external_id.clone();
            user.name = identity.name.clone();
            user.first_name = identity.first_name.clone();
            user.last_name = identity.last_name.clone();
            user.username = identity.username.clone();
            user.avatar_url = identity.avatar_url.clone();
            user.provider = identity.provider.clone();
            user.updated_at = now;
            return Ok(user.clone());
        }

        let user = User {
            id: UserId::new(),
            external_id: identity.external_id.clone(),
            email: identity.email.clone(),
            name: identity.name.clone(),
            first_name: identity.first_name.clone(),
            last_name: identity.last_name.clone(),
            username: identity.username.clone(),
            avatar_url: identity.avatar_url.clone(),
            provider: identity.provider.clone(),
            created_at: now,
            updated_at: now,
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    /// Looks up a user by email.
    pub fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.users.iter().find(|u| u.email == email).cloned())
    }

    /// Looks up a user by id.
    pub fn user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.users.iter().find(|u| u.id == user_id).cloned())
    }

    /// Starts a new session for `user_id`, implicitly ending any active
    /// one first. Enqueues a session-start unit carrying the user profile
    /// (after the prior session's end unit, when there is one).
    pub fn start_session(
        &self,
        user_id: UserId,
        device: BTreeMap<String, String>,
        app_version: impl Into<String>,
    ) -> StoreResult<SessionId> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let now = Utc::now();
        let user = inner.user(user_id)?.clone();

        if let Some(active) = inner
            .sessions
            .iter()
            .find(|s| s.user_id == user_id && s.is_active())
            .map(|s| s.id)
        {
            inner.end_session_inner(active, now)?;
        }

        let session = Session {
            id: SessionId::new(),
            user_id,
            started_at: now,
            ended_at: None,
            device,
            app_version: app_version.into(),
        };
        let session_id = session.id;
        inner.sessions.push(session.clone());
        inner.outbox.enqueue(
            user_id,
            OutboxPayload::SessionStart { user, session },
            None,
            now,
        );
        Ok(session_id)
    }

    /// Ends a session. Idempotent: ending an already-ended session is a
    /// no-op, not an error.
    pub fn end_session(&self, session_id: SessionId) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.end_session_inner(session_id, Utc::now())
    }

    /// Returns the active session for `user_id`, if any.
    pub fn active_session(&self, user_id: UserId) -> StoreResult<Option<Session>> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner
            .sessions
            .iter()
            .find(|s| s.user_id == user_id && s.is_active())
            .cloned())
    }

    /// Saves a question, enqueueing a question-answer unit (answer still
    /// empty) dependent on the session-start unit.
    pub fn save_question(
        &self,
        user_id: UserId,
        session_id: SessionId,
        text: impl Into<String>,
        kind: Option<String>,
        raw_input: Option<Vec<u8>>,
        metadata: Option<serde_json::Value>,
    ) -> StoreResult<QuestionId> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(StoreError::validation("question text is empty"));
        }
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.user(user_id)?;
        let session = inner.session_mut(session_id)?;
        if session.user_id != user_id {
            return Err(StoreError::validation(format!(
                "session {session_id} does not belong to user {user_id}"
            )));
        }
        let now = Utc::now();
        let question = QuestionRecord {
            id: QuestionId::new(),
            user_id,
            session_id,
            text,
            kind,
            raw_input,
            metadata,
            created_at: now,
        };
        let question_id = question.id;
        inner.questions.push(question.clone());
        let depends_on = inner.outbox.unit_for_session_start(session_id);
        inner.outbox.enqueue(
            user_id,
            OutboxPayload::QuestionAnswer {
                question,
                answer: None,
            },
            depends_on,
            now,
        );
        Ok(question_id)
    }

    /// Attaches an answer to a question.
    ///
    /// Fails with [`StoreError::QuestionNotFound`] if the question does
    /// not exist, and rejects a second answer for the same question. The
    /// answer coalesces into the question's still-pending outbox unit
    /// when possible; otherwise a separate dependent unit is enqueued.
    pub fn save_answer(
        &self,
        question_id: QuestionId,
        text: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        metadata: Option<serde_json::Value>,
        duration_ms: u64,
    ) -> StoreResult<AnswerId> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let question = inner
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .cloned()
            .ok_or(StoreError::QuestionNotFound(question_id))?;
        if inner.answers.iter().any(|a| a.question_id == question_id) {
            return Err(StoreError::validation(format!(
                "question {question_id} already has an answer"
            )));
        }
        let now = Utc::now();
        let answer = AnswerRecord {
            id: AnswerId::new(),
            question_id,
            text: text.into(),
            provider: provider.into(),
            model: model.into(),
            metadata,
            duration_ms,
            created_at: now,
        };
        let answer_id = answer.id;
        inner.answers.push(answer.clone());

        if !inner.outbox.coalesce_answer(question_id, &answer) {
            let depends_on = inner.outbox.unit_for_question(question_id);
            inner.outbox.enqueue(
                question.user_id,
                OutboxPayload::QuestionAnswer {
                    question,
                    answer: Some(answer),
                },
                depends_on,
                now,
            );
        }
        Ok(answer_id)
    }

    /// Logs a usage event. Always succeeds while the store is writable
    /// and never blocks on downstream sync.
    pub fn log_usage_event(
        &self,
        user_id: UserId,
        feature: impl Into<String>,
        action: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> StoreResult<EventId> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.user(user_id)?;
        let now = Utc::now();
        let event = UsageEvent {
            id: EventId::new(),
            user_id,
            feature: feature.into(),
            action: action.into(),
            details,
            occurred_at: now,
        };
        let event_id = event.id;
        inner.events.push(event.clone());
        inner
            .outbox
            .enqueue(user_id, OutboxPayload::UsageEvent(event), None, now);
        Ok(event_id)
    }

    /// Aggregates the user's full dataset for the export formatter.
    /// Read-only; not queued.
    pub fn export_user(&self, user_id: UserId) -> StoreResult<UserSnapshot> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner.snapshot(user_id)
    }

    /// Enqueues a full-snapshot unit for the user.
    pub fn queue_snapshot(&self, user_id: UserId) -> StoreResult<UnitId> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let snapshot = inner.snapshot(user_id)?;
        let now = Utc::now();
        Ok(inner
            .outbox
            .enqueue(user_id, OutboxPayload::ExportSnapshot(snapshot), None, now))
    }

    /// Deletes a user, cascading to sessions, questions, answers, usage
    /// events, and outbox units.
    pub fn delete_user(&self, user_id: UserId) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.user(user_id)?;
        inner.users.retain(|u| u.id != user_id);
        inner.sessions.retain(|s| s.user_id != user_id);
        let question_ids: Vec<QuestionId> = inner
            .questions
            .iter()
            .filter(|q| q.user_id == user_id)
            .map(|q| q.id)
            .collect();
        inner.questions.retain(|q| q.user_id != user_id);
        inner.answers.retain(|a| !question_ids.contains(&a.question_id));
        inner.events.retain(|e| e.user_id != user_id);
        inner.outbox.remove_user(user_id);
        Ok(())
    }

    // ---- Outbox access -------------------------------------------------
    //
    // The sync engine reads and transitions queue state through the
    // store, so queue state always lives behind the same source of truth
    // as the records themselves.

    /// Read-only view of up to `max` deliverable units in replay order.
    pub fn peek_batch(&self, max: usize, now: Timestamp) -> StoreResult<Vec<OutboxUnit>> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.outbox.peek_batch(max, now))
    }

    /// Marks a unit in-flight.
    pub fn mark_in_flight(&self, id: UnitId, now: Timestamp) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.outbox.mark_in_flight(id, now)
    }

    /// Marks a unit delivered.
    pub fn mark_delivered(&self, id: UnitId) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.outbox.mark_delivered(id)
    }

    /// Records a unit delivery failure.
    pub fn mark_failed(
        &self,
        id: UnitId,
        retryable: bool,
        next_attempt_at: Option<Timestamp>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.outbox.mark_failed(id, retryable, next_attempt_at)
    }

    /// Units still awaiting delivery.
    pub fn outbox_depth(&self) -> StoreResult<usize> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.outbox.depth())
    }

    /// Units still awaiting delivery for one user.
    pub fn outbox_depth_for_user(&self, user_id: UserId) -> StoreResult<usize> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.outbox.depth_for_user(user_id))
    }

    /// Permanently failed units, surfaced for operator review.
    pub fn failed_units(&self) -> StoreResult<Vec<OutboxUnit>> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.outbox.failed_units())
    }

    /// Reverts units stuck in-flight past `timeout` back to pending.
    pub fn recover_stuck(&self, now: Timestamp, timeout: Duration) -> StoreResult<usize> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        Ok(inner.outbox.recover_stuck(now, timeout))
    }

    /// Looks up one outbox unit.
    pub fn outbox_unit(&self, id: UnitId) -> StoreResult<Option<OutboxUnit>> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.outbox.unit(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::PayloadKind;

    fn identity(email: &str) -> Identity {
        Identity {
            external_id: "ext-1".into(),
            email: email.into(),
            name: "Test User".into(),
            first_name: "Test".into(),
            last_name: "User".into(),
            username: Some("testuser".into()),
            avatar_url: None,
            provider: "test".into(),
        }
    }

    fn store_with_session() -> (RecordStore, UserId, SessionId) {
        let store = RecordStore::new();
        let user = store.upsert_user(&identity("a@x.com")).unwrap();
        let session = store
            .start_session(user.id, BTreeMap::new(), "1.0.0")
            .unwrap();
        (store, user.id, session)
    }

    #[test]
    fn upsert_same_email_updates_in_place() {
        let store = RecordStore::new();
        let first = store.upsert_user(&identity("a@x.com")).unwrap();

        let mut changed = identity("a@x.com");
        changed.name = "Renamed".into();
        changed.avatar_url = Some("https://example.com/avatar.jpg".into());
        let second = store.upsert_user(&changed).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Renamed");
        assert_eq!(
            second.avatar_url.as_deref(),
            Some("https://example.com/avatar.jpg")
        );

        // Still exactly one user behind that email.
        let found = store.user_by_email("a@x.com").unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[test]
    fn upsert_rejects_invalid_identity() {
        let store = RecordStore::new();
        let mut bad = identity("not-an-email");
        bad.email = "not-an-email".into();
        assert!(matches!(
            store.upsert_user(&bad),
            Err(StoreError::Validation { .. })
        ));
    }

    #[test]
    fn at_most_one_active_session() {
        let (store, user_id, first) = store_with_session();

        let second = store
            .start_session(user_id, BTreeMap::new(), "1.0.1")
            .unwrap();

        let active = store.active_session(user_id).unwrap().unwrap();
        assert_eq!(active.id, second);

        // The first session got an implicit end stamp no later than the
        // second session's start.
        let snapshot = store.export_user(user_id).unwrap();
        let old = snapshot.sessions.iter().find(|s| s.id == first).unwrap();
        let new = snapshot.sessions.iter().find(|s| s.id == second).unwrap();
        assert!(old.ended_at.unwrap() <= new.started_at);
    }

    #[test]
    fn end_session_is_idempotent() {
        let (store, user_id, session) = store_with_session();
        let depth_before = store.outbox_depth().unwrap();

        store.end_session(session).unwrap();
        store.end_session(session).unwrap();

        assert!(store.active_session(user_id).unwrap().is_none());
        // Only one session-end unit despite the double call.
        assert_eq!(store.outbox_depth().unwrap(), depth_before + 1);
    }

    #[test]
    fn end_unknown_session_is_not_found() {
        let store = RecordStore::new();
        assert!(matches!(
            store.end_session(SessionId::new()),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn answer_requires_existing_question() {
        let store = RecordStore::new();
        let missing = QuestionId::new();
        assert!(matches!(
            store.save_answer(missing, "4", "test", "test-model", None, 10),
            Err(StoreError::QuestionNotFound(_))
        ));
    }

    #[test]
    fn second_answer_is_rejected() {
        let (store, user_id, session) = store_with_session();
        let question = store
            .save_question(user_id, session, "2+2?", Some("text".into()), None, None)
            .unwrap();
        store
            .save_answer(question, "4", "test", "test-model", None, 10)
            .unwrap();
        assert!(matches!(
            store.save_answer(question, "5", "test", "test-model", None, 10),
            Err(StoreError::Validation { .. })
        ));
    }

    #[test]
    fn auth_question_answer_usage_is_three_units() {
        let (store, user_id, session) = store_with_session();
        let question = store
            .save_question(user_id, session, "2+2?", Some("text".into()), None, None)
            .unwrap();
        store
            .save_answer(question, "4", "test", "test-model", None, 1500)
            .unwrap();
        store
            .log_usage_event(
                user_id,
                "screenshot",
                "captured",
                Some(serde_json::json!({ "method": "button" })),
            )
            .unwrap();

        // Session-start, coalesced question-answer pair, usage event.
        assert_eq!(store.outbox_depth().unwrap(), 3);

        let batch = store.peek_batch(10, Utc::now()).unwrap();
        let kinds: Vec<PayloadKind> = batch.iter().map(|u| u.payload.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                PayloadKind::SessionStart,
                PayloadKind::QuestionAnswer,
                PayloadKind::UsageEvent,
            ]
        );
        match &batch[1].payload {
            OutboxPayload::QuestionAnswer { answer, .. } => assert!(answer.is_some()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn question_unit_depends_on_session_start() {
        let (store, user_id, session) = store_with_session();
        store
            .save_question(user_id, session, "2+2?", None, None, None)
            .unwrap();

        let batch = store.peek_batch(10, Utc::now()).unwrap();
        let start = &batch[0];
        let question = &batch[1];
        assert_eq!(question.depends_on, Some(start.id));
    }

    #[test]
    fn snapshot_aggregates_everything() {
        let (store, user_id, session) = store_with_session();
        let question = store
            .save_question(
                user_id,
                session,
                "Solve this equation",
                Some("image_ocr".into()),
                Some(vec![0xDE, 0xAD]),
                Some(serde_json::json!({ "ocr_confidence": 0.95 })),
            )
            .unwrap();
        store
            .save_answer(question, "x = 2", "gemini", "gemini-1.5-flash", None, 2000)
            .unwrap();
        store
            .log_usage_event(user_id, "clipboard", "processed", None)
            .unwrap();

        let snapshot = store.export_user(user_id).unwrap();
        assert_eq!(snapshot.user.id, user_id);
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.questions.len(), 1);
        assert!(snapshot.questions[0].answer.is_some());
        assert_eq!(snapshot.events.len(), 1);
    }

    #[test]
    fn export_does_not_enqueue() {
        let (store, user_id, _session) = store_with_session();
        let depth = store.outbox_depth().unwrap();
        store.export_user(user_id).unwrap();
        assert_eq!(store.outbox_depth().unwrap(), depth);
    }

    #[test]
    fn queue_snapshot_enqueues_one_unit() {
        let (store, user_id, _session) = store_with_session();
        let depth = store.outbox_depth().unwrap();
        let unit_id = store.queue_snapshot(user_id).unwrap();
        assert_eq!(store.outbox_depth().unwrap(), depth + 1);
        let unit = store.outbox_unit(unit_id).unwrap().unwrap();
        assert_eq!(unit.payload.kind(), PayloadKind::ExportSnapshot);
    }

    #[test]
    fn delete_user_cascades() {
        let (store, user_id, session) = store_with_session();
        let question = store
            .save_question(user_id, session, "2+2?", None, None, None)
            .unwrap();
        store
            .save_answer(question, "4", "test", "test-model", None, 10)
            .unwrap();
        store
            .log_usage_event(user_id, "settings", "opened", None)
            .unwrap();

        store.delete_user(user_id).unwrap();

        assert!(store.user(user_id).unwrap().is_none());
        assert_eq!(store.outbox_depth().unwrap(), 0);
        assert!(matches!(
            store.export_user(user_id),
            Err(StoreError::UserNotFound(_))
        ));
    }

    #[test]
    fn closed_store_fails_fast() {
        let (store, user_id, _session) = store_with_session();
        store.close();

        assert!(matches!(
            store.upsert_user(&identity("b@x.com")),
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.log_usage_event(user_id, "settings", "opened", None),
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(store.outbox_depth(), Err(StoreError::Unavailable)));
    }
}
