//! Durable, ordered outbox queue of pending transfer units.
//!
//! Every mutating record-store write appends (or coalesces into) exactly
//! one unit here. Units carry a per-user monotonic sequence number that
//! defines replay order, and a deterministic transfer id so the Portal
//! can discard duplicate deliveries.

use crate::error::{StoreError, StoreResult};
use crate::model::{AnswerRecord, QuestionRecord, Session, UsageEvent, User, UserSnapshot};
use crate::types::{QuestionId, SessionId, Timestamp, UnitId, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Delivery state of an outbox unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Waiting to be delivered.
    Pending,
    /// Handed to the transport, awaiting acknowledgment.
    InFlight,
    /// Acknowledged by the Portal.
    Delivered,
    /// Permanently rejected; no further automatic attempts.
    Failed,
}

/// Kind tag for an outbox payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    /// A session began.
    SessionStart,
    /// A session ended.
    SessionEnd,
    /// A question, possibly with its answer.
    QuestionAnswer,
    /// A usage event.
    UsageEvent,
    /// A full user snapshot.
    ExportSnapshot,
}

impl PayloadKind {
    /// Stable numeric code, folded into the transfer id.
    pub fn code(self) -> u8 {
        match self {
            PayloadKind::SessionStart => 1,
            PayloadKind::SessionEnd => 2,
            PayloadKind::QuestionAnswer => 3,
            PayloadKind::UsageEvent => 4,
            PayloadKind::ExportSnapshot => 5,
        }
    }
}

/// The domain record wrapped by an outbox unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxPayload {
    /// A session began. Carries the owning user's profile as well, since
    /// the Portal's unit vocabulary has no standalone user record.
    SessionStart {
        /// Profile of the session owner.
        user: User,
        /// The session that started.
        session: Session,
    },
    /// A session ended.
    SessionEnd {
        /// The session that ended.
        session_id: SessionId,
        /// When it ended.
        ended_at: Timestamp,
    },
    /// A question, with its answer once one has been attached.
    QuestionAnswer {
        /// The question.
        question: QuestionRecord,
        /// The answer, if already generated.
        answer: Option<AnswerRecord>,
    },
    /// A usage event.
    UsageEvent(UsageEvent),
    /// A full snapshot of the user's dataset.
    ExportSnapshot(UserSnapshot),
}

impl OutboxPayload {
    /// Returns the payload kind tag.
    pub fn kind(&self) -> PayloadKind {
        match self {
            OutboxPayload::SessionStart { .. } => PayloadKind::SessionStart,
            OutboxPayload::SessionEnd { .. } => PayloadKind::SessionEnd,
            OutboxPayload::QuestionAnswer { .. } => PayloadKind::QuestionAnswer,
            OutboxPayload::UsageEvent(_) => PayloadKind::UsageEvent,
            OutboxPayload::ExportSnapshot(_) => PayloadKind::ExportSnapshot,
        }
    }
}

/// One pending transfer unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxUnit {
    /// Unit id.
    pub id: UnitId,
    /// Owning user.
    pub user_id: UserId,
    /// Per-user monotonic sequence number; defines replay order.
    pub sequence: u64,
    /// The wrapped domain record.
    pub payload: OutboxPayload,
    /// Current delivery state.
    pub state: DeliveryState,
    /// Number of delivery attempts made.
    pub attempts: u32,
    /// When the last attempt started.
    pub last_attempt_at: Option<Timestamp>,
    /// Backoff deadline; the unit is not re-attempted before this.
    pub next_attempt_at: Option<Timestamp>,
    /// Causal dependency: this unit must not be delivered if the
    /// referenced unit failed permanently.
    pub depends_on: Option<UnitId>,
    /// Deterministic transfer id, stable across retries.
    pub transfer_id: String,
    /// When the unit was enqueued.
    pub enqueued_at: Timestamp,
}

/// Derives the deterministic transfer id for a unit.
///
/// Stable across retries: a function of the owning user, the sequence
/// number, and the payload kind only.
fn derive_transfer_id(user_id: UserId, sequence: u64, kind: PayloadKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_uuid().as_bytes());
    hasher.update(sequence.to_be_bytes());
    hasher.update([kind.code()]);
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Ordered queue of outbox units.
///
/// Not internally synchronized; the owning [`RecordStore`] guards it with
/// the same lock that covers domain writes, which is what makes a domain
/// write and its outbox append atomic as a unit.
///
/// [`RecordStore`]: crate::RecordStore
#[derive(Debug, Default)]
pub struct OutboxQueue {
    /// Units in global enqueue order. Per-user sequences are increasing
    /// along this vector.
    units: Vec<OutboxUnit>,
    /// Next sequence number per user.
    next_sequence: HashMap<UserId, u64>,
}

impl OutboxQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a unit for `user_id`, assigning the next sequence number.
    pub fn enqueue(
        &mut self,
        user_id: UserId,
        payload: OutboxPayload,
        depends_on: Option<UnitId>,
        now: Timestamp,
    ) -> UnitId {
        let sequence = {
            let next = self.next_sequence.entry(user_id).or_insert(1);
            let seq = *next;
            *next += 1;
            seq
        };
        let id = UnitId::new();
        let transfer_id = derive_transfer_id(user_id, sequence, payload.kind());
        tracing::trace!(%user_id, sequence, transfer_id, "outbox enqueue");
        self.units.push(OutboxUnit {
            id,
            user_id,
            sequence,
            payload,
            state: DeliveryState::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            depends_on,
            transfer_id,
            enqueued_at: now,
        });
        id
    }

    /// Attaches an answer to the pending, never-attempted question unit
    /// for `question_id`, shipping the pair as one envelope.
    ///
    /// Returns `false` if no such unit exists (already attempted,
    /// delivered, or failed), in which case the caller enqueues a
    /// separate dependent unit instead. Coalescing after a delivery
    /// attempt is forbidden because the Portal may already know the
    /// unit's transfer id with the unanswered payload.
    pub fn coalesce_answer(&mut self, question_id: QuestionId, answer: &AnswerRecord) -> bool {
        for unit in &mut self.units {
            if unit.state != DeliveryState::Pending || unit.attempts != 0 {
                continue;
            }
            if let OutboxPayload::QuestionAnswer {
                question,
                answer: slot,
            } = &mut unit.payload
            {
                if question.id == question_id && slot.is_none() {
                    *slot = Some(answer.clone());
                    return true;
                }
            }
        }
        false
    }

    /// Finds the unit that carries the start of `session_id`.
    pub fn unit_for_session_start(&self, session_id: SessionId) -> Option<UnitId> {
        self.units.iter().find_map(|unit| match &unit.payload {
            OutboxPayload::SessionStart { session, .. } if session.id == session_id => {
                Some(unit.id)
            }
            _ => None,
        })
    }

    /// Finds the unit that carries `question_id`.
    pub fn unit_for_question(&self, question_id: QuestionId) -> Option<UnitId> {
        self.units.iter().find_map(|unit| match &unit.payload {
            OutboxPayload::QuestionAnswer { question, .. } if question.id == question_id => {
                Some(unit.id)
            }
            _ => None,
        })
    }

    /// Returns a unit by id.
    pub fn unit(&self, id: UnitId) -> Option<&OutboxUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    fn unit_mut(&mut self, id: UnitId) -> StoreResult<&mut OutboxUnit> {
        self.units
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(StoreError::UnitNotFound(id))
    }

    /// Walks the dependency chain; true if any link failed permanently.
    fn dependency_failed(&self, unit: &OutboxUnit) -> bool {
        let mut visited = HashSet::new();
        let mut next = unit.depends_on;
        while let Some(dep_id) = next {
            if !visited.insert(dep_id) {
                break;
            }
            match self.unit(dep_id) {
                Some(dep) if dep.state == DeliveryState::Failed => return true,
                Some(dep) => next = dep.depends_on,
                None => break,
            }
        }
        false
    }

    /// Returns up to `max` deliverable units, oldest first, in ascending
    /// per-user sequence order. Read-only; supports re-peek after failure.
    ///
    /// Per user this yields the longest deliverable prefix: delivered
    /// units are skipped, scanning stops at an in-flight or
    /// backoff-deferred unit, and permanently failed units are passed
    /// over — but a unit whose dependency chain reaches a failed unit is
    /// held (skipped) while later independent units remain eligible.
    pub fn peek_batch(&self, max: usize, now: Timestamp) -> Vec<OutboxUnit> {
        let mut batch = Vec::new();
        let mut blocked_users: HashSet<UserId> = HashSet::new();

        for unit in &self.units {
            if batch.len() >= max {
                break;
            }
            if blocked_users.contains(&unit.user_id) {
                continue;
            }
            match unit.state {
                DeliveryState::Delivered | DeliveryState::Failed => continue,
                DeliveryState::InFlight => {
                    blocked_users.insert(unit.user_id);
                }
                DeliveryState::Pending => {
                    if self.dependency_failed(unit) {
                        // Held: dependents of a poisoned unit must not be
                        // delivered, but later independent units may.
                        continue;
                    }
                    if unit.next_attempt_at.is_some_and(|at| at > now) {
                        // An earlier unit waiting out its backoff blocks
                        // everything after it for this user.
                        blocked_users.insert(unit.user_id);
                        continue;
                    }
                    batch.push(unit.clone());
                }
            }
        }
        batch
    }

    /// Marks a pending unit in-flight, counting the attempt.
    pub fn mark_in_flight(&mut self, id: UnitId, now: Timestamp) -> StoreResult<()> {
        let unit = self.unit_mut(id)?;
        if unit.state != DeliveryState::Pending {
            return Err(StoreError::validation(format!(
                "unit {id} is {:?}, not pending",
                unit.state
            )));
        }
        unit.state = DeliveryState::InFlight;
        unit.attempts += 1;
        unit.last_attempt_at = Some(now);
        Ok(())
    }

    /// Marks an in-flight unit delivered. Rejects any other state, so a
    /// stray acknowledgment cannot skip a unit past the ordered drain.
    pub fn mark_delivered(&mut self, id: UnitId) -> StoreResult<()> {
        let unit = self.unit_mut(id)?;
        if unit.state != DeliveryState::InFlight {
            return Err(StoreError::validation(format!(
                "unit {id} is {:?}, not in-flight",
                unit.state
            )));
        }
        unit.state = DeliveryState::Delivered;
        unit.next_attempt_at = None;
        Ok(())
    }

    /// Records a delivery failure for an in-flight unit.
    ///
    /// Retryable failures return the unit to pending with the given
    /// backoff deadline; permanent ones park it in [`DeliveryState::Failed`]
    /// for operator attention.
    pub fn mark_failed(
        &mut self,
        id: UnitId,
        retryable: bool,
        next_attempt_at: Option<Timestamp>,
    ) -> StoreResult<()> {
        let unit = self.unit_mut(id)?;
        if unit.state != DeliveryState::InFlight {
            return Err(StoreError::validation(format!(
                "unit {id} is {:?}, not in-flight",
                unit.state
            )));
        }
        if retryable {
            unit.state = DeliveryState::Pending;
            unit.next_attempt_at = next_attempt_at;
        } else {
            unit.state = DeliveryState::Failed;
            unit.next_attempt_at = None;
        }
        Ok(())
    }

    /// Number of units still awaiting delivery (pending or in-flight).
    pub fn depth(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.state, DeliveryState::Pending | DeliveryState::InFlight))
            .count()
    }

    /// Like [`depth`](Self::depth), restricted to one user.
    pub fn depth_for_user(&self, user_id: UserId) -> usize {
        self.units
            .iter()
            .filter(|u| u.user_id == user_id)
            .filter(|u| matches!(u.state, DeliveryState::Pending | DeliveryState::InFlight))
            .count()
    }

    /// Units parked as permanently failed, for operator review.
    pub fn failed_units(&self) -> Vec<OutboxUnit> {
        self.units
            .iter()
            .filter(|u| u.state == DeliveryState::Failed)
            .cloned()
            .collect()
    }

    /// Reverts units stuck in-flight past `timeout` back to pending.
    ///
    /// A timed-out transmission is a transient failure; nothing stays
    /// in-flight indefinitely. Returns the number of units recovered.
    pub fn recover_stuck(&mut self, now: Timestamp, timeout: Duration) -> usize {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut recovered = 0;
        for unit in &mut self.units {
            if unit.state != DeliveryState::InFlight {
                continue;
            }
            let stuck = match unit.last_attempt_at {
                Some(at) => at + timeout <= now,
                None => true,
            };
            if stuck {
                unit.state = DeliveryState::Pending;
                unit.next_attempt_at = None;
                recovered += 1;
            }
        }
        recovered
    }

    /// Drops all units belonging to `user_id` (cascade delete).
    pub fn remove_user(&mut self, user_id: UserId) {
        self.units.retain(|u| u.user_id != user_id);
        self.next_sequence.remove(&user_id);
    }
}
