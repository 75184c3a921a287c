//! Export formatter for Outpost user snapshots.
//!
//! Renders a [`outpost_store::UserSnapshot`] into a self-contained
//! document a user can take with them: JSON mirroring the snapshot
//! structure, or CSV with one row per leaf record. Formatting is pure;
//! nothing here touches the store or the Portal.

pub mod error;
pub mod formatter;

pub use error::{ExportError, ExportResult};
pub use formatter::{format, Export, ExportKind};
