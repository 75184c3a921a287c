//! Store and sync-engine fixtures.
//!
//! Convenience constructors for pre-seeded stores, engines wired to a
//! mock Portal, and a representative user snapshot.

use outpost_store::{Identity, QuestionId, RecordStore, SessionId, UserId, UserSnapshot};
use outpost_sync::{MockPortal, RetryConfig, SyncConfig, SyncEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Builds a valid identity for the given email address.
pub fn test_identity(email: &str) -> Identity {
    Identity {
        external_id: format!("ext-{email}"),
        email: email.to_string(),
        name: "Test User".into(),
        first_name: "Test".into(),
        last_name: "User".into(),
        username: Some("testuser".into()),
        avatar_url: None,
        provider: "test".into(),
    }
}

/// A store pre-seeded with one user, one active session, and one
/// answered question.
pub struct SeededStore {
    /// The store.
    pub store: Arc<RecordStore>,
    /// The seeded user.
    pub user_id: UserId,
    /// The seeded user's active session.
    pub session_id: SessionId,
    /// The seeded, answered question.
    pub question_id: QuestionId,
}

/// Creates a [`SeededStore`] for `seed@example.com`.
pub fn seeded_store() -> SeededStore {
    let store = Arc::new(RecordStore::new());
    let user = store
        .upsert_user(&test_identity("seed@example.com"))
        .expect("seed user");
    let session_id = store
        .start_session(user.id, device_metadata(), "1.2.0")
        .expect("seed session");
    let question_id = store
        .save_question(
            user.id,
            session_id,
            "What is the capital of France?",
            Some("text".into()),
            None,
            None,
        )
        .expect("seed question");
    store
        .save_answer(question_id, "Paris", "test", "test-model", None, 1200)
        .expect("seed answer");
    store
        .log_usage_event(
            user.id,
            "screenshot",
            "captured",
            Some(serde_json::json!({ "method": "hotkey" })),
        )
        .expect("seed event");
    SeededStore {
        store,
        user_id: user.id,
        session_id,
        question_id,
    }
}

/// A representative user snapshot: one ended session, one answered
/// question, two usage events.
pub fn sample_snapshot() -> UserSnapshot {
    let seeded = seeded_store();
    seeded
        .store
        .log_usage_event(seeded.user_id, "settings", "opened", None)
        .expect("second event");
    seeded
        .store
        .end_session(seeded.session_id)
        .expect("end session");
    seeded
        .store
        .export_user(seeded.user_id)
        .expect("export snapshot")
}

/// Device metadata used by the fixtures.
pub fn device_metadata() -> BTreeMap<String, String> {
    let mut device = BTreeMap::new();
    device.insert("platform".into(), "linux".into());
    device.insert("arch".into(), "x86_64".into());
    device
}

/// A sync config suited to tests: no probe caching, immediate retries.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig::new("https://portal.test")
        .with_probe_cache_ttl(Duration::ZERO)
        .with_retry(RetryConfig::immediate())
}

/// Wires a sync engine over a fresh mock Portal for the given store.
pub fn test_engine(store: Arc<RecordStore>) -> (Arc<MockPortal>, SyncEngine<MockPortal>) {
    let portal = Arc::new(MockPortal::new());
    let engine = SyncEngine::new(test_sync_config(), store, Arc::clone(&portal))
        .expect("engine construction");
    (portal, engine)
}
