//! # edgequake-docreview
//!
//! Review résumés and job-application entry sheets with an LLM and hand back
//! an annotated copy of the original document.
//!
//! ## Why this crate?
//!
//! Asking a model to "review this CV" is easy; putting each remark on the
//! exact paragraph it is about is not. Models paraphrase, OCR garbles
//! spacing, and position hints are often missing or wrong. This crate asks
//! the model to quote the document verbatim, then re-anchors every quote
//! onto the OCR block it really came from, and only keeps remarks whose
//! quote can be verified in that block.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload / URL
//!  │
//!  ├─ 1. Normalize  republish PDFs, convert anything else via an external tool
//!  ├─ 2. Extract    OCR once into positioned [P#B#] text blocks
//!  ├─ 3. Generate   employer context + completion call (one narrowed retry)
//!  ├─ 4. Resolve    anchor quotes onto blocks; heuristics when nothing anchors
//!  └─ 5. Annotate   overlay the items on a copy of the PDF
//! ```
//!
//! Every artifact goes through [`BlobStore`], which works either on a local
//! directory or on an S3-compatible bucket.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docreview::{
//!     BlobStore, DocumentReviewer, InMemoryRepository, ReviewConfig, ReviewRequest,
//!     StorageConfig, UploadRequest, UploadedFile,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reviewer = DocumentReviewer::new(
//!         Arc::new(InMemoryRepository::new()),
//!         BlobStore::from_config(&StorageConfig::from_env()),
//!         ReviewConfig::from_env(),
//!     )?;
//!     let document = reviewer
//!         .upload(UploadRequest {
//!             user_id: 1,
//!             file: Some(UploadedFile {
//!                 filename: "cv.pdf".into(),
//!                 bytes: std::fs::read("cv.pdf")?,
//!             }),
//!             ..Default::default()
//!         })
//!         .await?;
//!     let output = reviewer
//!         .review_document(document.id, &ReviewRequest::default())
//!         .await?;
//!     println!("score {}: {}", output.review.score, output.review.summary);
//!     for item in &output.items {
//!         println!("p{} [{}] {}", item.page_number, item.severity, item.message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docreview` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docreview = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod completion;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod repository;
pub mod review;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use completion::{CompletionClient, LlmCompletionClient};
pub use config::{CommandSpec, ReviewConfig, ReviewConfigBuilder, StorageConfig};
pub use error::{CompletionError, ReviewError, StageError};
pub use model::{
    BoundingBox, Document, DocumentStatus, RecordId, Review, ReviewItem, ReviewOutput,
    ReviewStats, Severity, SourceKind, TextBlock,
};
pub use pipeline::input::UploadedFile;
pub use process::{ProcessOutput, ProcessRunner, SystemProcessRunner};
pub use progress::{NoopProgressCallback, ProgressCallback, ReviewProgressCallback, Stage};
pub use repository::{InMemoryRepository, ReviewRepository};
pub use review::{AnnotatedArtifact, DocumentReviewer, ReviewRequest, UploadRequest};
pub use storage::{BlobStore, BlobStream, StorageRef};
