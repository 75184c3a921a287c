//! Sync engine state machine.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::transport::{PortalTransport, TransferEnvelope};
use chrono::Utc;
use outpost_store::{RecordStore, Timestamp, UnitId, UserId};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Checking Portal reachability.
    Probing,
    /// Draining the outbox to the Portal.
    Draining,
}

impl SyncState {
    /// Returns true if a sync cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Probing | SyncState::Draining)
    }

    /// Returns true if a new cycle may start (single-flight guard).
    pub fn can_start(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total sync cycles completed.
    pub cycles_completed: u64,
    /// Total units delivered.
    pub units_delivered: u64,
    /// Total units permanently failed.
    pub units_failed: u64,
    /// Last error message, if the last cycle errored.
    pub last_error: Option<String>,
    /// When the last cycle finished.
    pub last_sync_at: Option<Timestamp>,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Units delivered this cycle.
    pub delivered: usize,
    /// Units still awaiting delivery after the cycle.
    pub queued: usize,
    /// Units newly parked as permanently failed this cycle.
    pub failed: usize,
    /// Transfer id of the last delivered unit, if any.
    pub last_transfer_id: Option<String>,
}

/// Caller-facing result of [`SyncEngine::transfer_data_to_portal`].
///
/// `queued = true` means the data was accepted locally but the Portal
/// could not be reached this cycle. That is not a failure; the outbox
/// replays it once connectivity returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Whether the cycle completed without permanent rejections.
    pub success: bool,
    /// Transfer id of the last delivered unit, if any.
    pub transfer_id: Option<String>,
    /// Whether units remain queued locally.
    pub queued: bool,
    /// Error description, if anything went wrong.
    pub error: Option<String>,
}

/// Drains the outbox to the Portal when it is reachable.
///
/// State machine per cycle: `Idle -> Probing -> (Draining | Idle)`;
/// `Draining -> Idle` on batch exhaustion. A cycle never overlaps
/// another (single-flight), and the engine never blocks record-store
/// writers beyond individual queue-state transitions.
pub struct SyncEngine<T: PortalTransport> {
    config: SyncConfig,
    store: Arc<RecordStore>,
    transport: Arc<T>,
    monitor: ConnectivityMonitor<T>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl<T: PortalTransport> SyncEngine<T> {
    /// Creates a new engine and runs the in-flight recovery sweep:
    /// units left in-flight past the configured timeout (for example by
    /// a crash mid-transmission) revert to pending.
    pub fn new(
        config: SyncConfig,
        store: Arc<RecordStore>,
        transport: Arc<T>,
    ) -> SyncResult<Self> {
        let recovered = store.recover_stuck(Utc::now(), config.in_flight_timeout)?;
        if recovered > 0 {
            tracing::info!(recovered, "reverted stuck in-flight units to pending");
        }
        let monitor = ConnectivityMonitor::new(
            Arc::clone(&transport),
            config.probe_timeout,
            config.probe_cache_ttl,
        );
        Ok(Self {
            config,
            store,
            transport,
            monitor,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the accumulated stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The engine's connectivity monitor.
    pub fn monitor(&self) -> &ConnectivityMonitor<T> {
        &self.monitor
    }

    /// Runs one sync cycle.
    ///
    /// Probes connectivity first; if the Portal is unreachable the cycle
    /// returns immediately with nothing delivered and the current queue
    /// depth as `queued`. Otherwise drains a batch in replay order:
    /// transient failures back the unit off and stop that user's drain,
    /// permanent rejections park the unit and hold its dependents while
    /// later independent units continue.
    pub fn sync_once(&self) -> SyncResult<SyncOutcome> {
        {
            let mut state = self.state.write();
            if !state.can_start() {
                return Err(SyncError::SyncInProgress);
            }
            *state = SyncState::Probing;
        }

        let result = self.run_cycle();
        *self.state.write() = SyncState::Idle;

        let mut stats = self.stats.write();
        stats.last_sync_at = Some(Utc::now());
        match &result {
            Ok(outcome) => {
                stats.cycles_completed += 1;
                stats.units_delivered += outcome.delivered as u64;
                stats.units_failed += outcome.failed as u64;
                stats.last_error = None;
            }
            Err(err) => {
                stats.last_error = Some(err.to_string());
            }
        }
        result
    }

    fn run_cycle(&self) -> SyncResult<SyncOutcome> {
        if !self.monitor.is_reachable() {
            let queued = self.store.outbox_depth()?;
            tracing::debug!(queued, "portal unreachable, leaving units queued");
            return Ok(SyncOutcome {
                delivered: 0,
                queued,
                failed: 0,
                last_transfer_id: None,
            });
        }

        *self.state.write() = SyncState::Draining;
        let batch = self
            .store
            .peek_batch(self.config.batch_size, Utc::now())?;
        tracing::debug!(batch = batch.len(), "draining outbox");

        let mut delivered = 0;
        let mut failed = 0;
        let mut last_transfer_id = None;
        let mut stopped_users: HashSet<UserId> = HashSet::new();
        let mut poisoned: HashSet<UnitId> = HashSet::new();

        for unit in batch {
            if stopped_users.contains(&unit.user_id) {
                continue;
            }
            if unit
                .depends_on
                .is_some_and(|dep| poisoned.contains(&dep))
            {
                // Its dependency was rejected earlier this cycle; hold
                // it, and anything chained on it.
                poisoned.insert(unit.id);
                continue;
            }

            self.store.mark_in_flight(unit.id, Utc::now())?;
            // Re-read after claiming: an answer may have coalesced into
            // the unit between the batch peek and the claim, and the
            // stale peeked clone would transmit without it. Claiming
            // counts an attempt, which shuts the coalesce window.
            let Some(claimed) = self.store.outbox_unit(unit.id)? else {
                continue;
            };
            let envelope = TransferEnvelope::from_unit(&claimed);
            match self
                .transport
                .transfer(&envelope, self.config.transfer_timeout)
            {
                Ok(ack) => {
                    self.store.mark_delivered(unit.id)?;
                    if ack.duplicate {
                        tracing::debug!(
                            transfer_id = %ack.transfer_id,
                            "portal discarded duplicate transfer"
                        );
                    }
                    delivered += 1;
                    last_transfer_id = Some(ack.transfer_id);
                }
                Err(err) if err.is_retryable() => {
                    let attempts = claimed.attempts;
                    let delay = self.config.retry.delay_after_attempts(attempts);
                    let next_attempt_at = Utc::now() + to_chrono(delay);
                    self.store
                        .mark_failed(unit.id, true, Some(next_attempt_at))?;
                    tracing::debug!(
                        transfer_id = %claimed.transfer_id,
                        attempts,
                        error = %err,
                        "transient delivery failure, backing off"
                    );
                    // Preserve ordering: nothing later for this user is
                    // attempted this cycle.
                    stopped_users.insert(unit.user_id);
                }
                Err(err) => {
                    self.store.mark_failed(unit.id, false, None)?;
                    poisoned.insert(unit.id);
                    failed += 1;
                    tracing::warn!(
                        transfer_id = %claimed.transfer_id,
                        error = %err,
                        "permanent rejection, unit parked for operator review"
                    );
                }
            }
        }

        let queued = self.store.outbox_depth()?;
        Ok(SyncOutcome {
            delivered,
            queued,
            failed,
            last_transfer_id,
        })
    }

    /// Caller-facing wrapper around [`sync_once`](Self::sync_once).
    ///
    /// Errors are contained: the result always describes what happened
    /// rather than propagating. `queued = true` with `success = true`
    /// means the data is safe locally and will replay later.
    pub fn transfer_data_to_portal(&self) -> TransferReport {
        match self.sync_once() {
            Ok(outcome) => TransferReport {
                success: outcome.failed == 0,
                transfer_id: outcome.last_transfer_id,
                queued: outcome.queued > 0,
                error: (outcome.failed > 0)
                    .then(|| format!("{} unit(s) permanently rejected", outcome.failed)),
            },
            Err(err) => TransferReport {
                success: false,
                transfer_id: None,
                queued: false,
                error: Some(err.to_string()),
            },
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
