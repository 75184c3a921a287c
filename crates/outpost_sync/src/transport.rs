//! Portal transport abstraction.

use crate::error::{SyncError, SyncResult};
use outpost_store::{OutboxPayload, OutboxUnit, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One record-bearing payload sent to the Portal.
///
/// Tagged with the unit's deterministic transfer id so the Portal can
/// discard a duplicate delivery it has already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    /// Deterministic transfer id, stable across retries.
    pub transfer_id: String,
    /// Owning user.
    pub user_id: UserId,
    /// Per-user sequence number.
    pub sequence: u64,
    /// The wrapped domain record.
    pub payload: OutboxPayload,
}

impl TransferEnvelope {
    /// Builds the envelope for an outbox unit.
    pub fn from_unit(unit: &OutboxUnit) -> Self {
        Self {
            transfer_id: unit.transfer_id.clone(),
            user_id: unit.user_id,
            sequence: unit.sequence,
            payload: unit.payload.clone(),
        }
    }
}

/// The Portal's acknowledgment of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    /// Echo of the transfer id.
    pub transfer_id: String,
    /// True if the Portal had already applied this transfer id and
    /// discarded the duplicate.
    pub duplicate: bool,
}

/// Network communication with the Portal.
///
/// Abstracts the wire so the engine can be tested against a mock, and so
/// different HTTP clients can back the real implementation.
pub trait PortalTransport: Send + Sync {
    /// Best-effort reachability probe. Never errors; an unreachable
    /// Portal and a timed-out probe both report `false`.
    fn probe(&self, timeout: Duration) -> bool;

    /// Transmits one envelope, blocking up to `timeout`.
    fn transfer(&self, envelope: &TransferEnvelope, timeout: Duration) -> SyncResult<TransferAck>;
}

/// A mock Portal for testing.
///
/// Tracks applied transfer ids (so duplicate deliveries are observable),
/// and can be scripted to be unreachable or to fail specific transfers
/// transiently or permanently.
#[derive(Debug, Default)]
pub struct MockPortal {
    reachable: AtomicBool,
    applied: Mutex<Vec<String>>,
    seen: Mutex<HashSet<String>>,
    fail_transient_once: Mutex<HashSet<String>>,
    reject: Mutex<HashSet<String>>,
}

impl MockPortal {
    /// Creates a reachable mock Portal.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets whether the Portal is reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Scripts a single transient failure for a transfer id.
    pub fn fail_transient_once(&self, transfer_id: impl Into<String>) {
        self.fail_transient_once.lock().insert(transfer_id.into());
    }

    /// Scripts a permanent rejection for a transfer id.
    pub fn reject(&self, transfer_id: impl Into<String>) {
        self.reject.lock().insert(transfer_id.into());
    }

    /// Transfer ids applied so far, in application order. Duplicates are
    /// discarded and never appear twice.
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }
}

impl PortalTransport for MockPortal {
    fn probe(&self, _timeout: Duration) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn transfer(&self, envelope: &TransferEnvelope, _timeout: Duration) -> SyncResult<TransferAck> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("portal unreachable"));
        }
        if self.reject.lock().contains(&envelope.transfer_id) {
            return Err(SyncError::Rejected(format!(
                "transfer {} rejected",
                envelope.transfer_id
            )));
        }
        if self.fail_transient_once.lock().remove(&envelope.transfer_id) {
            return Err(SyncError::transport_retryable("simulated network error"));
        }
        let duplicate = !self.seen.lock().insert(envelope.transfer_id.clone());
        if !duplicate {
            self.applied.lock().push(envelope.transfer_id.clone());
        }
        Ok(TransferAck {
            transfer_id: envelope.transfer_id.clone(),
            duplicate,
        })
    }
}
