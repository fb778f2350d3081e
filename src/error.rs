//! Error types for the edgequake-docreview library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ReviewError`] is **fatal**: the review cannot proceed at all (no input,
//!   storage backend unreachable, conversion or OCR failed).
//!   Returned as `Err(ReviewError)` from the top-level entry points.
//!
//! * [`StageError`] is **non-fatal**: a stage degraded (the completion service
//!   failed, the overlay renderer crashed) but the review still stands.
//!   Stored on [`crate::model::ReviewOutput`] so callers can see what went
//!   wrong without losing the review itself.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docreview library.
#[derive(Debug, Error)]
pub enum ReviewError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Neither a file nor a source URL was supplied, or the input is unusable.
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    /// A remote source could not be downloaded.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// The remote blob backend is configured but cannot be used.
    #[error("Blob storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A storage reference or record does not resolve.
    #[error("Not found: {0}")]
    NotFound(String),

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The external conversion process did not produce a canonical document.
    #[error("Conversion of '{path}' failed: {detail}")]
    ConversionFailed { path: PathBuf, detail: String },

    /// The external OCR process failed or produced unreadable output.
    #[error("Text extraction failed: {detail}\n{diagnostics}")]
    ExtractionFailed { detail: String, diagnostics: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// The repository layer rejected an operation.
    #[error("Repository error: {0}")]
    Repository(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (scratch I/O, task join failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReviewError {
    /// Whether this is one of the failures a review request reports to its
    /// caller, rather than an operator-side problem.
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            ReviewError::InputInvalid(_)
                | ReviewError::DownloadFailed { .. }
                | ReviewError::StorageUnavailable(_)
                | ReviewError::ConversionFailed { .. }
                | ReviewError::ExtractionFailed { .. }
        )
    }
}

impl From<std::io::Error> for ReviewError {
    fn from(e: std::io::Error) -> Self {
        ReviewError::Internal(e.to_string())
    }
}

/// A non-fatal error for a single stage.
///
/// Generation failures trigger the heuristic reviewer; annotation failures
/// leave the document at `normalized`; enrichment failures are only logged.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// The completion capability failed or returned unusable output.
    #[error("Review generation failed: {detail}")]
    GenerationFailed { detail: String },

    /// The overlay renderer failed; the review is persisted regardless.
    #[error("Annotation failed: {detail}")]
    AnnotationFailed { detail: String },

    /// Employer-context lookup failed.
    #[error("Enrichment failed: {detail}")]
    EnrichmentFailed { detail: String },
}

/// Failure of one call to the completion capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompletionError {
    /// The call did not finish within its per-call timeout.
    #[error("Completion timed out after {0}s")]
    Timeout(u64),

    /// The provider returned an error (HTTP failure, rate limit, auth, …).
    #[error("Completion provider error: {0}")]
    Provider(String),

    /// The provider answered with blank content.
    #[error("Completion returned empty content")]
    Empty,

    /// The caller's review deadline passed before or during the call.
    #[error("Review deadline exceeded")]
    DeadlineExceeded,
}

impl From<CompletionError> for StageError {
    fn from(e: CompletionError) -> Self {
        StageError::GenerationFailed {
            detail: e.to_string(),
        }
    }
}
