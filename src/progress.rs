//! Progress-callback trait for per-stage review events.
//!
//! Inject an [`Arc<dyn ReviewProgressCallback>`] via
//! [`crate::config::ReviewConfigBuilder::progress_callback`] to receive events
//! as the pipeline moves through its stages. Callers can forward them to a
//! terminal spinner, a WebSocket, or a job-status row without the library
//! knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docreview::{ReviewConfig, ReviewProgressCallback, Stage};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl ReviewProgressCallback for Printer {
//!     fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
//!         eprintln!("{stage} done in {elapsed_ms}ms");
//!     }
//! }
//!
//! let config = ReviewConfig::builder()
//!     .progress_callback(Arc::new(Printer))
//!     .build()
//!     .unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Pipeline stages reported to callbacks, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Normalize,
    Extract,
    Generate,
    Annotate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Normalize => "normalize",
            Stage::Extract => "extract",
            Stage::Generate => "generate",
            Stage::Annotate => "annotate",
        };
        f.write_str(s)
    }
}

/// Called by the review pipeline as it runs.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Implementations must be `Send + Sync`: reviews of
/// different documents may share one callback across tasks.
pub trait ReviewProgressCallback: Send + Sync {
    /// Called when a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes, degraded or not.
    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        let _ = (stage, elapsed_ms);
    }

    /// Called when a stage falls back to a lower-quality result.
    ///
    /// # Arguments
    /// * `stage`: the stage that degraded
    /// * `reason`: human-readable description
    fn on_stage_degraded(&self, stage: Stage, reason: &str) {
        let _ = (stage, reason);
    }

    /// Called once after the review and its items are persisted.
    fn on_review_complete(&self, item_count: usize) {
        let _ = item_count;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ReviewProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ReviewConfig`].
pub type ProgressCallback = Arc<dyn ReviewProgressCallback>;
