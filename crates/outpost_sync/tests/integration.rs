//! Integration tests for the sync engine against a mock Portal.

use chrono::Utc;
use outpost_store::{DeliveryState, Identity, OutboxPayload, PayloadKind, RecordStore};
use outpost_sync::{
    MockPortal, PortalTransport, RetryConfig, SyncConfig, SyncEngine, SyncError, SyncResult,
    TransferAck, TransferEnvelope, TransferReport,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

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

fn engine_config() -> SyncConfig {
    SyncConfig::new("https://portal.example.com")
        .with_probe_cache_ttl(Duration::ZERO)
        .with_retry(RetryConfig::immediate())
}

#[test]
fn offline_queue_then_connectivity_gated_replay() {
    let store = Arc::new(RecordStore::new());
    let portal = Arc::new(MockPortal::new());
    let engine =
        SyncEngine::new(engine_config(), Arc::clone(&store), Arc::clone(&portal)).unwrap();

    // a@x.com authenticates, a session starts, a question is answered,
    // a usage event is logged.
    let user = store.upsert_user(&identity("a@x.com")).unwrap();
    let session = store
        .start_session(user.id, BTreeMap::new(), "1.0.0")
        .unwrap();
    let question = store
        .save_question(user.id, session, "2+2?", Some("text".into()), None, None)
        .unwrap();
    store
        .save_answer(question, "4", "test", "test-model", None, 1500)
        .unwrap();
    store
        .log_usage_event(
            user.id,
            "screenshot",
            "captured",
            Some(serde_json::json!({ "method": "button" })),
        )
        .unwrap();

    // Portal offline: the transfer call succeeds but queues.
    portal.set_reachable(false);
    let report = engine.transfer_data_to_portal();
    assert_eq!(
        report,
        TransferReport {
            success: true,
            transfer_id: None,
            queued: true,
            error: None,
        }
    );
    assert_eq!(store.outbox_depth().unwrap(), 3);
    assert!(portal.applied().is_empty());

    // Portal comes back: one cycle delivers all three in enqueue order.
    portal.set_reachable(true);
    let expected: Vec<String> = store
        .peek_batch(10, Utc::now())
        .unwrap()
        .iter()
        .map(|u| u.transfer_id.clone())
        .collect();

    let outcome = engine.sync_once().unwrap();
    assert_eq!(outcome.delivered, 3);
    assert_eq!(outcome.queued, 0);
    assert_eq!(portal.applied(), expected);
    assert_eq!(store.outbox_depth().unwrap(), 0);
}

#[test]
fn poisoned_unit_holds_dependents_but_not_independents() {
    let store = Arc::new(RecordStore::new());
    let portal = Arc::new(MockPortal::new());
    let engine =
        SyncEngine::new(engine_config(), Arc::clone(&store), Arc::clone(&portal)).unwrap();

    let user = store.upsert_user(&identity("a@x.com")).unwrap();
    let session = store
        .start_session(user.id, BTreeMap::new(), "1.0.0")
        .unwrap();
    engine.sync_once().unwrap();
    assert_eq!(store.outbox_depth().unwrap(), 0);

    // The question's unit will be permanently rejected.
    let question = store
        .save_question(user.id, session, "2+2?", Some("text".into()), None, None)
        .unwrap();
    let question_unit = store.peek_batch(10, Utc::now()).unwrap()[0].clone();
    portal.reject(question_unit.transfer_id.clone());

    let outcome = engine.sync_once().unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(
        store.failed_units().unwrap()[0].transfer_id,
        question_unit.transfer_id
    );

    // The answer now lands in its own unit, dependent on the poisoned
    // question; a usage event is independent.
    store
        .save_answer(question, "4", "test", "test-model", None, 900)
        .unwrap();
    store
        .log_usage_event(user.id, "settings", "opened", None)
        .unwrap();

    let outcome = engine.sync_once().unwrap();
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 0);

    // Only the usage event went through; the dependent answer is held.
    let applied = portal.applied();
    assert_eq!(applied.len(), 2); // session start + usage event
    assert_eq!(store.outbox_depth().unwrap(), 1);
    let held = store.peek_batch(10, Utc::now()).unwrap();
    assert!(held.is_empty());

    let snapshot_units = store.failed_units().unwrap();
    assert_eq!(snapshot_units.len(), 1);
}

#[test]
fn dependents_queued_in_same_cycle_as_rejection_are_held() {
    let store = Arc::new(RecordStore::new());
    let portal = Arc::new(MockPortal::new());
    let engine =
        SyncEngine::new(engine_config(), Arc::clone(&store), Arc::clone(&portal)).unwrap();

    let user = store.upsert_user(&identity("a@x.com")).unwrap();
    let session = store
        .start_session(user.id, BTreeMap::new(), "1.0.0")
        .unwrap();

    // Reject the session-start unit itself: everything that hangs off
    // the session must be held in the very cycle the rejection happens.
    let start_unit = store.peek_batch(10, Utc::now()).unwrap()[0].clone();
    portal.reject(start_unit.transfer_id.clone());

    store
        .save_question(user.id, session, "2+2?", None, None, None)
        .unwrap();
    store
        .log_usage_event(user.id, "clipboard", "processed", None)
        .unwrap();

    let outcome = engine.sync_once().unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.delivered, 1);

    // Only the independent usage event was applied; the question unit
    // stays pending but held, so nothing is peekable.
    assert_eq!(portal.applied().len(), 1);
    assert!(store.peek_batch(10, Utc::now()).unwrap().is_empty());
    assert_eq!(store.outbox_depth().unwrap(), 1);
}

#[test]
fn session_rollover_delivers_end_before_new_start() {
    let store = Arc::new(RecordStore::new());
    let portal = Arc::new(MockPortal::new());
    let engine =
        SyncEngine::new(engine_config(), Arc::clone(&store), Arc::clone(&portal)).unwrap();

    let user = store.upsert_user(&identity("a@x.com")).unwrap();
    let first = store
        .start_session(user.id, BTreeMap::new(), "1.0.0")
        .unwrap();
    let second = store
        .start_session(user.id, BTreeMap::new(), "1.0.1")
        .unwrap();
    assert_ne!(first, second);

    let batch = store.peek_batch(10, Utc::now()).unwrap();
    let kinds: Vec<PayloadKind> = batch.iter().map(|u| u.payload.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            PayloadKind::SessionStart,
            PayloadKind::SessionEnd,
            PayloadKind::SessionStart,
        ]
    );

    let expected: Vec<String> = batch.iter().map(|u| u.transfer_id.clone()).collect();
    engine.sync_once().unwrap();
    assert_eq!(portal.applied(), expected);

    let active = store.active_session(user.id).unwrap().unwrap();
    assert_eq!(active.id, second);
}

#[test]
fn backoff_gates_retry_until_deadline_passes() {
    let store = Arc::new(RecordStore::new());
    let portal = Arc::new(MockPortal::new());
    let config = SyncConfig::new("https://portal.example.com")
        .with_probe_cache_ttl(Duration::ZERO)
        .with_retry(RetryConfig::new(Duration::from_secs(3600)));
    let engine = SyncEngine::new(config, Arc::clone(&store), Arc::clone(&portal)).unwrap();

    let user = store.upsert_user(&identity("a@x.com")).unwrap();
    store
        .log_usage_event(user.id, "screenshot", "captured", None)
        .unwrap();

    let unit = store.peek_batch(10, Utc::now()).unwrap()[0].clone();
    portal.fail_transient_once(unit.transfer_id.clone());

    engine.sync_once().unwrap();
    let unit = store.outbox_unit(unit.id).unwrap().unwrap();
    assert_eq!(unit.state, DeliveryState::Pending);
    assert_eq!(unit.attempts, 1);

    // Within the hour-long backoff the unit is not re-attempted.
    let outcome = engine.sync_once().unwrap();
    assert_eq!(outcome.delivered, 0);
    assert_eq!(outcome.queued, 1);
    assert!(portal.applied().is_empty());
}

/// A transport that parks the first transfer until released and records
/// every envelope it receives.
struct CapturingPortal {
    inner: MockPortal,
    received: Mutex<Vec<TransferEnvelope>>,
    gate_first: AtomicBool,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl PortalTransport for CapturingPortal {
    fn probe(&self, timeout: Duration) -> bool {
        self.inner.probe(timeout)
    }

    fn transfer(&self, envelope: &TransferEnvelope, timeout: Duration) -> SyncResult<TransferAck> {
        if self.gate_first.swap(false, Ordering::SeqCst) {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5));
        }
        self.received.lock().unwrap().push(envelope.clone());
        self.inner.transfer(envelope, timeout)
    }
}

#[test]
fn answer_coalesced_during_drain_is_transmitted() {
    let store = Arc::new(RecordStore::new());
    let user = store.upsert_user(&identity("a@x.com")).unwrap();
    let session = store
        .start_session(user.id, BTreeMap::new(), "1.0.0")
        .unwrap();
    let question = store
        .save_question(user.id, session, "2+2?", Some("text".into()), None, None)
        .unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let portal = Arc::new(CapturingPortal {
        inner: MockPortal::new(),
        received: Mutex::new(Vec::new()),
        gate_first: AtomicBool::new(true),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let engine = Arc::new(
        SyncEngine::new(engine_config(), Arc::clone(&store), Arc::clone(&portal)).unwrap(),
    );

    let background = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.sync_once())
    };
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync never reached the transport");

    // The batch is already peeked; the answer coalesces into the still
    // pending question unit rather than enqueueing a new one.
    store
        .save_answer(question, "4", "test", "test-model", None, 700)
        .unwrap();
    assert_eq!(store.outbox_depth().unwrap(), 2);

    release_tx.send(()).unwrap();
    let outcome = background.join().unwrap().unwrap();
    assert_eq!(outcome.delivered, 2);
    assert_eq!(store.outbox_depth().unwrap(), 0);

    // The transmitted question envelope carries the coalesced answer.
    let received = portal.received.lock().unwrap().clone();
    let answer = received
        .iter()
        .find_map(|env| match &env.payload {
            OutboxPayload::QuestionAnswer { answer, .. } => Some(answer.clone()),
            _ => None,
        })
        .expect("question envelope");
    assert!(answer.is_some());
}

/// A transport that parks the first transfer until released, to pin the
/// engine inside a cycle.
struct GatedPortal {
    inner: MockPortal,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl PortalTransport for GatedPortal {
    fn probe(&self, timeout: Duration) -> bool {
        self.inner.probe(timeout)
    }

    fn transfer(&self, envelope: &TransferEnvelope, timeout: Duration) -> SyncResult<TransferAck> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5));
        self.inner.transfer(envelope, timeout)
    }
}

#[test]
fn sync_cycles_are_single_flight() {
    let store = Arc::new(RecordStore::new());
    let user = store.upsert_user(&identity("a@x.com")).unwrap();
    store
        .log_usage_event(user.id, "screenshot", "captured", None)
        .unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let portal = Arc::new(GatedPortal {
        inner: MockPortal::new(),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });

    let engine = Arc::new(
        SyncEngine::new(engine_config(), Arc::clone(&store), Arc::clone(&portal)).unwrap(),
    );

    let background = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.sync_once())
    };

    // Wait until the background cycle is inside the transport, then a
    // second cycle must refuse to overlap it.
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("background sync never reached the transport");
    assert!(matches!(
        engine.sync_once(),
        Err(SyncError::SyncInProgress)
    ));

    release_tx.send(()).unwrap();
    let outcome = background.join().unwrap().unwrap();
    assert_eq!(outcome.delivered, 1);

    // Once the cycle finishes, a new one may start.
    assert!(engine.sync_once().is_ok());
}
