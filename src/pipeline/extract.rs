//! Text-block extraction through the external OCR command.
//!
//! The OCR command prints one JSON document on stdout:
//!
//! ```json
//! {"pages":[{"page_number":1,"width":1240,"height":1754,
//!   "blocks":[{"block_index":1,"text":"…","bbox":[x0,y0,x1,y1]}]}]}
//! ```
//!
//! Every block carries its page's pixel size so overlays can be rescaled
//! later. Extraction failure is terminal for the review: without text there
//! is nothing to review.

use super::decode_lenient;
use crate::config::ReviewConfig;
use crate::error::ReviewError;
use crate::model::{BoundingBox, RecordId, TextBlock};
use crate::process::{run_command, ProcessRunner};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct OcrPayload {
    #[serde(default)]
    pages: Vec<OcrPage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page_number: u32,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
    #[serde(default)]
    blocks: Vec<OcrBlock>,
}

#[derive(Debug, Deserialize)]
struct OcrBlock {
    block_index: u32,
    #[serde(default)]
    text: String,
    #[serde(default)]
    bbox: Vec<f64>,
}

/// Run OCR over `pdf` and return its blocks ordered by page, then index.
pub async fn extract_blocks(
    document_id: RecordId,
    pdf: &Path,
    runner: &Arc<dyn ProcessRunner>,
    config: &ReviewConfig,
) -> Result<Vec<TextBlock>, ReviewError> {
    let workdir = pdf.parent().unwrap_or_else(|| Path::new("."));
    let input = pdf.to_string_lossy().to_string();
    let tools_dir = config.tools_dir.to_string_lossy().to_string();

    let output = run_command(
        runner,
        &config.ocr_command,
        &[("input", &input), ("tools_dir", &tools_dir)],
        workdir,
    )
    .await
    .map_err(|e| ReviewError::ExtractionFailed {
        detail: format!("could not run {}: {}", config.ocr_command.program, e),
        diagnostics: String::new(),
    })?;

    if !output.success {
        return Err(ReviewError::ExtractionFailed {
            detail: format!("{} exited with {}", config.ocr_command.program, output.status_line()),
            diagnostics: output.diagnostics(),
        });
    }

    let blocks = parse_ocr_output(document_id, &output.stdout).map_err(|detail| {
        ReviewError::ExtractionFailed {
            detail,
            diagnostics: output.diagnostics(),
        }
    })?;

    let pages: HashSet<u32> = blocks.iter().map(|b| b.page_number).collect();
    info!(
        "Extracted {} blocks on {} pages from document {}",
        blocks.len(),
        pages.len(),
        document_id
    );
    Ok(blocks)
}

/// Parse OCR stdout into blocks.
///
/// Pages without a number are numbered by position. Blocks whose bounding
/// box is not four numbers, and repeated `(page, block)` pairs, are skipped
/// with a warning since they could never be anchored unambiguously.
pub fn parse_ocr_output(document_id: RecordId, stdout: &str) -> Result<Vec<TextBlock>, String> {
    let payload: OcrPayload =
        decode_lenient(stdout).map_err(|e| format!("unreadable OCR output: {e}"))?;

    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for (position, page) in payload.pages.into_iter().enumerate() {
        let page_number = if page.page_number > 0 {
            page.page_number
        } else {
            position as u32 + 1
        };
        let page_width = page.width.max(0.0).round() as u32;
        let page_height = page.height.max(0.0).round() as u32;

        for block in page.blocks {
            let corners: [f64; 4] = match block.bbox.as_slice().try_into() {
                Ok(c) => c,
                Err(_) => {
                    warn!(
                        "Skipping P{}B{}: bbox has {} values",
                        page_number,
                        block.block_index,
                        block.bbox.len()
                    );
                    continue;
                }
            };
            if !seen.insert((page_number, block.block_index)) {
                warn!("Skipping duplicate block P{}B{}", page_number, block.block_index);
                continue;
            }
            blocks.push(TextBlock {
                document_id,
                page_number,
                block_index: block.block_index,
                text: block.text,
                bbox: BoundingBox::from_corners(corners, page_width, page_height),
            });
        }
    }

    blocks.sort_by_key(|b| (b.page_number, b.block_index));
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{ok_output, ScriptedRunner};
    use crate::process::{ProcessOutput, SystemProcessRunner};
    use tempfile::TempDir;

    const PAYLOAD: &str = r#"{"pages":[
        {"page_number":2,"width":1240,"height":1754,"blocks":[
            {"block_index":1,"text":"Skills: Go, SQL","bbox":[10,300,400,330]}]},
        {"page_number":1,"width":1240,"height":1754,"blocks":[
            {"block_index":2,"text":"second","bbox":[10,60,400,90]},
            {"block_index":1,"text":"first","bbox":[10,20,400,50]}]}
    ]}"#;

    #[test]
    fn blocks_are_ordered_and_carry_page_size() {
        let blocks = parse_ocr_output(9, PAYLOAD).unwrap();
        let keys: Vec<_> = blocks.iter().map(|b| (b.page_number, b.block_index)).collect();
        assert_eq!(keys, vec![(1, 1), (1, 2), (2, 1)]);
        assert_eq!(blocks[0].text, "first");
        assert_eq!(blocks[0].document_id, 9);
        assert_eq!(blocks[0].bbox.corners(), [10.0, 20.0, 400.0, 50.0]);
        assert_eq!((blocks[0].bbox.page_width, blocks[0].bbox.page_height), (1240, 1754));
    }

    #[test]
    fn log_lines_around_json_are_tolerated() {
        let noisy = format!("loading model...\n{PAYLOAD}\ndone\n");
        assert_eq!(parse_ocr_output(1, &noisy).unwrap().len(), 3);
    }

    #[test]
    fn malformed_and_duplicate_blocks_are_skipped() {
        let raw = r#"{"pages":[{"width":100,"height":100,"blocks":[
            {"block_index":1,"text":"a","bbox":[1,2,3]},
            {"block_index":2,"text":"b","bbox":[1,2,3,4]},
            {"block_index":2,"text":"c","bbox":[1,2,3,4]}]}]}"#;
        let blocks = parse_ocr_output(1, raw).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].page_number, 1);
        assert_eq!(blocks[0].text, "b");
    }

    #[test]
    fn empty_document_has_no_blocks() {
        assert!(parse_ocr_output(1, r#"{"pages":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_ocr_output(1, "Traceback (most recent call last)").is_err());
    }

    #[tokio::test]
    async fn ocr_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("original.pdf");
        let runner: Arc<dyn ProcessRunner> = Arc::new(ScriptedRunner::new(|_, _, _| {
            Ok(ProcessOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: "ModuleNotFoundError: paddleocr".into(),
            })
        }));
        let err = extract_blocks(1, &pdf, &runner, &ReviewConfig::default())
            .await
            .unwrap_err();
        match err {
            ReviewError::ExtractionFailed { diagnostics, .. } => {
                assert!(diagnostics.contains("paddleocr"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ocr_command_gets_input_path() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("original.pdf");
        let runner = Arc::new(ScriptedRunner::new(|_, _, _| Ok(ok_output(PAYLOAD))));
        let dyn_runner: Arc<dyn ProcessRunner> = runner.clone();
        let blocks = extract_blocks(1, &pdf, &dyn_runner, &ReviewConfig::default())
            .await
            .unwrap();
        assert_eq!(blocks.len(), 3);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "python3");
        assert!(calls[0].1.contains(&pdf.to_string_lossy().to_string()));
        let script = Path::new(&calls[0].1[0]);
        assert!(script.is_absolute());
        assert!(script.ends_with("scripts/ocr_extract.py"));
    }

    #[tokio::test]
    async fn default_command_finds_script_outside_scratch_dir() {
        let has_python = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !has_python {
            eprintln!("python3 not available, skipping");
            return;
        }
        let tools = TempDir::new().unwrap();
        std::fs::write(
            tools.path().join("ocr_extract.py"),
            format!("import sys\nassert sys.argv[1] == '--input'\nprint('''{PAYLOAD}''')\n"),
        )
        .unwrap();
        let scratch = TempDir::new().unwrap();
        let pdf = scratch.path().join("normalized.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        let config = ReviewConfig::builder()
            .tools_dir(tools.path())
            .build()
            .unwrap();
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner);
        let blocks = extract_blocks(1, &pdf, &runner, &config).await.unwrap();
        assert_eq!(blocks.len(), 3);
    }
}
