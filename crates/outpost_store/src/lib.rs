//! # Outpost Store
//!
//! Local-first record store with a durable outbox.
//!
//! This crate provides:
//! - Domain records: users, sessions, question/answer pairs, usage events
//! - A record store with upsert/session/Q&A/usage operations
//! - A durable, per-user-ordered outbox queue of pending transfer units
//! - Snapshot aggregation for export
//!
//! ## Key Invariants
//!
//! - At most one active session per user
//! - Every domain write and its outbox append are atomic as a unit
//! - Outbox units for one user are delivered in sequence order
//! - Transfer ids are deterministic and stable across retries

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod model;
mod outbox;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use model::{
    AnswerRecord, Identity, QuestionAnswer, QuestionRecord, Session, UsageEvent, User, UserSnapshot,
};
pub use outbox::{DeliveryState, OutboxPayload, OutboxQueue, OutboxUnit, PayloadKind};
pub use store::RecordStore;
pub use types::{AnswerId, EventId, QuestionId, SessionId, Timestamp, UnitId, UserId};
