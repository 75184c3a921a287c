//! Export error types.

use thiserror::Error;

/// Errors surfaced while rendering an export document.
#[derive(Debug, Error)]
pub enum ExportError {
    /// JSON serialization failed.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV serialization failed.
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    /// The CSV writer produced bytes that are not valid UTF-8.
    #[error("export buffer is not valid UTF-8")]
    InvalidUtf8,
}

/// Result alias for export operations.
pub type ExportResult<T> = Result<T, ExportError>;
