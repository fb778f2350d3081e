//! Records that flow between pipeline stages and the repository.
//!
//! All types are `Serialize + Deserialize` so the host application can store
//! them however it likes and so a review can be dumped as JSON from the CLI.

use crate::error::StageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by the repository.
pub type RecordId = u64;

// ── Document ─────────────────────────────────────────────────────────────

/// Where a submitted document came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A file uploaded by the user; the string is the declared type (`pdf`, `docx`, …).
    Upload(String),
    /// A file fetched from an HTTP(S) URL at upload time.
    RemoteUrl,
    /// A reference to a hosted document, fetched from its URL when normalised.
    RemoteDoc,
}

impl SourceKind {
    /// Parse the source-type string sent by clients. Blank means `pdf`.
    pub fn parse(raw: &str, has_file: bool) -> Self {
        let kind = raw.trim().to_lowercase();
        match kind.as_str() {
            "google_docs" | "remote_doc" => SourceKind::RemoteDoc,
            "url" | "remote_url" if !has_file => SourceKind::RemoteUrl,
            "" => {
                if has_file {
                    SourceKind::Upload("pdf".to_string())
                } else {
                    SourceKind::RemoteUrl
                }
            }
            _ if has_file => SourceKind::Upload(kind),
            _ => SourceKind::RemoteUrl,
        }
    }
}

/// Lifecycle of a document. Strictly monotonic within one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Uploaded,
    Normalized,
    Reviewed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Normalized => "normalized",
            DocumentStatus::Reviewed => "reviewed",
        };
        f.write_str(s)
    }
}

/// One submitted file.
///
/// `normalized` is set only once normalisation succeeded and `annotated` only
/// once annotation succeeded; both hold storage references as produced by
/// [`crate::storage::BlobStore::put`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: RecordId,
    pub user_id: RecordId,
    pub session_id: String,
    pub source_kind: SourceKind,
    pub source_url: Option<String>,
    pub original_filename: String,
    pub stored: Option<String>,
    pub normalized: Option<String>,
    pub annotated: Option<String>,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A fresh, not-yet-persisted document (`id == 0`).
    pub fn new(user_id: RecordId, session_id: impl Into<String>, source_kind: SourceKind) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            session_id: session_id.into(),
            source_kind,
            source_url: None,
            original_filename: String::new(),
            stored: None,
            normalized: None,
            annotated: None,
            status: DocumentStatus::Uploaded,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Text blocks ──────────────────────────────────────────────────────────

/// A block's rectangle in page pixel space, plus the pixel size of the page
/// it was measured on so overlays can be rescaled to any resolution.
///
/// Serialised as `{"bbox":[l,t,r,b],"page_width":w,"page_height":h}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "BoundingBoxWire", into = "BoundingBoxWire")]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub page_width: u32,
    pub page_height: u32,
}

impl BoundingBox {
    /// Box used when an item cannot be tied to any extracted block.
    pub const DEFAULT: BoundingBox = BoundingBox {
        left: 20.0,
        top: 20.0,
        right: 260.0,
        bottom: 80.0,
        page_width: 0,
        page_height: 0,
    };

    pub fn from_corners(corners: [f64; 4], page_width: u32, page_height: u32) -> Self {
        Self {
            left: corners[0],
            top: corners[1],
            right: corners[2],
            bottom: corners[3],
            page_width,
            page_height,
        }
    }

    pub fn corners(&self) -> [f64; 4] {
        [self.left, self.top, self.right, self.bottom]
    }
}

#[derive(Serialize, Deserialize)]
struct BoundingBoxWire {
    bbox: [f64; 4],
    #[serde(default)]
    page_width: u32,
    #[serde(default)]
    page_height: u32,
}

impl From<BoundingBoxWire> for BoundingBox {
    fn from(w: BoundingBoxWire) -> Self {
        BoundingBox::from_corners(w.bbox, w.page_width, w.page_height)
    }
}

impl From<BoundingBox> for BoundingBoxWire {
    fn from(b: BoundingBox) -> Self {
        BoundingBoxWire {
            bbox: b.corners(),
            page_width: b.page_width,
            page_height: b.page_height,
        }
    }
}

/// One OCR-extracted text fragment. `(document_id, page_number, block_index)`
/// is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub document_id: RecordId,
    /// 1-based page number.
    pub page_number: u32,
    pub block_index: u32,
    pub text: String,
    pub bbox: BoundingBox,
}

// ── Review ───────────────────────────────────────────────────────────────

/// One evaluation of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: RecordId,
    pub document_id: RecordId,
    /// 0–100.
    pub score: u32,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl Review {
    pub fn new(score: u32, summary: impl Into<String>) -> Self {
        Self {
            id: 0,
            document_id: 0,
            score: score.min(100),
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Lenient parse of model output: case-insensitive, anything unknown is `Info`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "warning" | "warn" => Severity::Warning,
            "critical" | "error" => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One critique anchored to a text block's rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub review_id: RecordId,
    pub page_number: u32,
    pub bbox: BoundingBox,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ReviewItem {
    /// An item placed exactly on `block`.
    pub fn on_block(
        block: &TextBlock,
        severity: Severity,
        message: impl Into<String>,
        suggestion: Option<String>,
    ) -> Self {
        Self {
            review_id: 0,
            page_number: block.page_number,
            bbox: block.bbox,
            severity,
            message: message.into(),
            suggestion: suggestion.filter(|s| !s.trim().is_empty()),
        }
    }
}

// ── Output ───────────────────────────────────────────────────────────────

/// Counters describing one review run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewStats {
    /// Text blocks extracted from the document.
    pub blocks: usize,
    /// `complete_json` calls issued (at most 2).
    pub completion_calls: usize,
    /// Items returned by the model in the pass that was kept.
    pub raw_items: usize,
    /// Items anchored to a block in the pass that was kept.
    pub anchored_items: usize,
    /// Items the model returned that could not be anchored, across all passes.
    pub dropped_items: usize,
    /// Whether the narrowed retry prompt was issued.
    pub retried: bool,
    /// Whether the heuristic reviewer produced the items.
    pub fallback_used: bool,
    pub duration_ms: u64,
}

/// Result of [`crate::review::DocumentReviewer::review_document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub document: Document,
    pub review: Review,
    pub items: Vec<ReviewItem>,
    pub stats: ReviewStats,
    /// Non-fatal degradations encountered along the way.
    pub stage_errors: Vec<StageError>,
}

impl ReviewOutput {
    /// The annotation error, if annotation failed.
    pub fn annotation_error(&self) -> Option<&StageError> {
        self.stage_errors
            .iter()
            .find(|e| matches!(e, StageError::AnnotationFailed { .. }))
    }
}
