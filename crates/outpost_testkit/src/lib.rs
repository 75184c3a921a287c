//! # Outpost Testkit
//!
//! Test utilities shared across the Outpost crates.
//!
//! This crate provides:
//! - Store and sync-engine fixtures with pre-seeded data
//! - Property-based test generators using proptest
//! - One-shot tracing initialization for test binaries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use outpost_testkit::fixtures::seeded_store;
//!
//! #[test]
//! fn test_with_store() {
//!     let seeded = seeded_store();
//!     let snapshot = seeded.store.export_user(seeded.user_id).unwrap();
//!     // ... assertions
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

pub use fixtures::*;
pub use generators::*;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Initializes a tracing subscriber for test output, once per process.
///
/// Respects `RUST_LOG`; defaults to `warn` when unset. Safe to call
/// from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
