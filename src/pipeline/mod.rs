//! Pipeline stages for document review.
//!
//! Each submodule implements exactly one step. Keeping stages separate makes
//! each independently testable and lets a host swap an external tool (the
//! converter, the OCR engine) without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ normalize ──▶ extract ──▶ generate ──▶ annotate
//! (upload/URL) (→ PDF)    (OCR)       │  ▲          (overlay)
//!                                     ▼  │
//!                          enrich   resolve ──▶ fallback
//! ```
//!
//! 1. [`input`]    : save uploaded bytes or download a URL into scratch space
//! 2. [`normalize`]: republish PDFs, convert everything else via an external process
//! 3. [`extract`]  : run OCR once per document and parse positioned text blocks
//! 4. [`enrich`]   : best-effort employer context for the prompt
//! 5. [`generate`] : completion calls, lenient JSON decoding, one narrowed retry
//! 6. [`resolve`]  : anchor each quote onto the block it came from
//! 7. [`fallback`] : keyword heuristics when nothing could be anchored
//! 8. [`annotate`] : overlay the anchored items on a copy of the PDF

pub mod annotate;
pub mod enrich;
pub mod extract;
pub mod fallback;
pub mod generate;
pub mod input;
pub mod normalize;
pub mod resolve;

use serde::de::DeserializeOwned;

/// Decode JSON that may be wrapped in prose, code fences or log lines.
///
/// The whole input is tried first, then the outermost `{…}` span.
pub fn decode_lenient<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty response".into());
    }
    let first_err = match serde_json::from_str(raw) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => {
            serde_json::from_str(&raw[start..=end]).map_err(|e| e.to_string())
        }
        _ => Err(first_err.to_string()),
    }
}
