//! # Outpost Sync
//!
//! Sync engine draining the Outpost outbox to the Portal.
//!
//! This crate provides:
//! - Sync state machine (idle → probing → draining)
//! - Connectivity monitor with cached reachability probes
//! - Retry with per-unit exponential backoff
//! - Portal transport abstraction with an in-crate mock
//! - Caller-facing transfer wrapper with contained errors
//!
//! ## Key Invariants
//!
//! - Units for one user are delivered in sequence order
//! - Delivery is at-least-once; the Portal deduplicates by transfer id
//! - A transient failure stops that user's drain; a permanent one parks
//!   the unit and holds only its causal dependents
//! - No unit stays in-flight indefinitely; a restart sweep reverts
//!   stuck units to pending

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod engine;
mod error;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use engine::{SyncEngine, SyncOutcome, SyncState, SyncStats, TransferReport};
pub use error::{SyncError, SyncResult};
pub use transport::{MockPortal, PortalTransport, TransferAck, TransferEnvelope};
