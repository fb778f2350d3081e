//! Overlay rendering through the external annotation command.
//!
//! The command receives the normalised PDF, an overlay file and an output
//! path. The overlay file is a JSON array with one entry per item:
//!
//! ```json
//! [{"page_number":1,"bbox":[x0,y0,x1,y1],"page_width":1240,"page_height":1754,
//!   "message":"…","suggestion":"…"}]
//! ```
//!
//! Boxes are in the pixel space of the recorded page size; the renderer
//! rescales them to the PDF page. A review without items republishes the
//! normalised PDF unchanged.

use crate::config::ReviewConfig;
use crate::error::StageError;
use crate::model::{Document, RecordId, ReviewItem};
use crate::process::{run_command, ProcessRunner};
use crate::storage::{document_key, BlobStore, StorageRef};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Name under which the annotated document is published.
pub const ANNOTATED_FILENAME: &str = "annotated.pdf";

#[derive(Debug, Serialize)]
struct OverlayItem<'a> {
    page_number: u32,
    bbox: [f64; 4],
    page_width: u32,
    page_height: u32,
    message: &'a str,
    suggestion: &'a str,
}

fn overlay_json(items: &[ReviewItem]) -> Result<String, serde_json::Error> {
    let overlay: Vec<OverlayItem<'_>> = items
        .iter()
        .map(|item| OverlayItem {
            page_number: item.page_number,
            bbox: item.bbox.corners(),
            page_width: item.bbox.page_width,
            page_height: item.bbox.page_height,
            message: &item.message,
            suggestion: item.suggestion.as_deref().unwrap_or(""),
        })
        .collect();
    serde_json::to_string_pretty(&overlay)
}

/// Render and publish the annotated copy of `normalized_pdf`.
#[allow(clippy::too_many_arguments)]
pub async fn annotate(
    document: &Document,
    review_id: RecordId,
    normalized_pdf: &Path,
    items: &[ReviewItem],
    workdir: &Path,
    store: &BlobStore,
    runner: &Arc<dyn ProcessRunner>,
    config: &ReviewConfig,
) -> Result<StorageRef, StageError> {
    let failed = |detail: String| StageError::AnnotationFailed { detail };
    let key = document_key(document.user_id, document.id, ANNOTATED_FILENAME);

    if items.is_empty() {
        let reference = store
            .put(normalized_pdf, &key, "application/pdf")
            .await
            .map_err(|e| failed(e.to_string()))?;
        info!("No items for document {}, republished unannotated", document.id);
        return Ok(reference);
    }

    let items_path = workdir.join(format!("review_items_{review_id}.json"));
    let output_path = workdir.join(ANNOTATED_FILENAME);
    let json = overlay_json(items).map_err(|e| failed(e.to_string()))?;
    tokio::fs::write(&items_path, json)
        .await
        .map_err(|e| failed(format!("writing {}: {e}", items_path.display())))?;

    let input = normalized_pdf.to_string_lossy().to_string();
    let output = output_path.to_string_lossy().to_string();
    let items_arg = items_path.to_string_lossy().to_string();
    let tools_dir = config.tools_dir.to_string_lossy().to_string();
    let result = run_command(
        runner,
        &config.annotate_command,
        &[
            ("input", &input),
            ("output", &output),
            ("items", &items_arg),
            ("tools_dir", &tools_dir),
        ],
        workdir,
    )
    .await
    .map_err(|e| failed(format!("could not run {}: {e}", config.annotate_command.program)))?;

    if !result.success {
        return Err(failed(format!(
            "{} exited with {}: {}",
            config.annotate_command.program,
            result.status_line(),
            result.diagnostics()
        )));
    }
    if !tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
        return Err(failed(format!("renderer produced no {ANNOTATED_FILENAME}")));
    }

    let reference = store
        .put(&output_path, &key, "application/pdf")
        .await
        .map_err(|e| failed(e.to_string()))?;
    info!(
        "Annotated document {} with {} items, published as {}",
        document.id,
        items.len(),
        reference
    );
    Ok(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundingBox, Severity, SourceKind};
    use crate::process::testing::{ok_output, ScriptedRunner};
    use crate::process::ProcessOutput;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn document() -> Document {
        let mut doc = Document::new(7, "s", SourceKind::Upload("pdf".into()));
        doc.id = 42;
        doc
    }

    fn item() -> ReviewItem {
        ReviewItem {
            review_id: 3,
            page_number: 1,
            bbox: BoundingBox::from_corners([10.0, 20.0, 400.0, 50.0], 1240, 1754),
            severity: Severity::Warning,
            message: "Say what X was".into(),
            suggestion: None,
        }
    }

    fn setup() -> (TempDir, TempDir, PathBuf) {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let pdf = work.path().join("normalized.pdf");
        std::fs::write(&pdf, b"%PDF normalized").unwrap();
        (work, root, pdf)
    }

    #[tokio::test]
    async fn zero_items_republishes_without_process() {
        let (work, root, pdf) = setup();
        let runner = Arc::new(ScriptedRunner::unused());
        let dyn_runner: Arc<dyn ProcessRunner> = runner.clone();
        let store = BlobStore::local(root.path());

        let reference = annotate(
            &document(),
            3,
            &pdf,
            &[],
            work.path(),
            &store,
            &dyn_runner,
            &ReviewConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(runner.call_count(), 0);
        let StorageRef::Local(path) = reference else {
            panic!("expected local reference");
        };
        assert!(path.ends_with("resumes/7/42/annotated.pdf"));
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF normalized");
    }

    #[tokio::test]
    async fn overlay_file_is_written_and_output_published() {
        let (work, root, pdf) = setup();
        let runner = Arc::new(ScriptedRunner::new(|_, args, _| {
            let items_path = &args[args.iter().position(|a| a == "--items").unwrap() + 1];
            let overlay: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(items_path).unwrap()).unwrap();
            assert_eq!(overlay[0]["bbox"], serde_json::json!([10.0, 20.0, 400.0, 50.0]));
            assert_eq!(overlay[0]["page_width"], 1240);
            assert_eq!(overlay[0]["suggestion"], "");
            let output = &args[args.iter().position(|a| a == "--output").unwrap() + 1];
            std::fs::write(output, b"%PDF annotated").unwrap();
            Ok(ok_output(""))
        }));
        let dyn_runner: Arc<dyn ProcessRunner> = runner.clone();
        let store = BlobStore::local(root.path());

        let reference = annotate(
            &document(),
            3,
            &pdf,
            &[item()],
            work.path(),
            &store,
            &dyn_runner,
            &ReviewConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(runner.call_count(), 1);
        assert!(work.path().join("review_items_3.json").exists());
        let StorageRef::Local(path) = reference else {
            panic!("expected local reference");
        };
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF annotated");
    }

    #[tokio::test]
    async fn renderer_crash_is_annotation_failure() {
        let (work, root, pdf) = setup();
        let runner: Arc<dyn ProcessRunner> = Arc::new(ScriptedRunner::new(|_, _, _| {
            Ok(ProcessOutput {
                success: false,
                code: Some(2),
                stdout: String::new(),
                stderr: "font not found".into(),
            })
        }));
        let store = BlobStore::local(root.path());

        let err = annotate(
            &document(),
            3,
            &pdf,
            &[item()],
            work.path(),
            &store,
            &runner,
            &ReviewConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::AnnotationFailed { .. }));
        assert!(err.to_string().contains("font not found"));
    }
}
