//! Format normalisation: make sure the pipeline works on a PDF.
//!
//! The original artifact is materialised in the scratch directory. A PDF is
//! republished as-is under `normalized.pdf`, with no external process. Any
//! other format is handed to the conversion command, which must leave exactly
//! one `<stem>.pdf` next to its input. Conversion is assumed deterministic,
//! so a missing output is a hard failure and is never retried.

use super::input::{download_source, extension_of};
use crate::config::ReviewConfig;
use crate::error::ReviewError;
use crate::model::Document;
use crate::process::{run_command, ProcessRunner};
use crate::storage::{document_key, BlobStore, StorageRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name under which the canonical document is published.
pub const NORMALIZED_FILENAME: &str = "normalized.pdf";

/// Result of normalising one document.
#[derive(Debug, Clone)]
pub struct Normalized {
    /// Local path of the canonical PDF inside the scratch directory.
    pub path: PathBuf,
    /// Where the canonical PDF was published.
    pub reference: StorageRef,
    /// Whether the external converter ran.
    pub converted: bool,
}

/// Fetch the original of `document` into `workdir`.
///
/// Documents without a stored artifact but with a source URL (remote-doc
/// references) are downloaded here.
pub async fn fetch_original(
    document: &Document,
    workdir: &Path,
    store: &BlobStore,
    download_timeout_secs: u64,
) -> Result<PathBuf, ReviewError> {
    let stored = document
        .stored
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if let Some(raw) = stored {
        let reference = StorageRef::parse(raw)?;
        let mut ext = extension_of(&reference.file_name());
        if ext.is_empty() {
            ext = extension_of(&document.original_filename);
        }
        if ext.is_empty() {
            ext = ".pdf".to_string();
        }
        let dest = workdir.join(format!("original{ext}"));
        store.get_local_copy(&reference, &dest).await?;
        debug!("Fetched original {} → {}", reference, dest.display());
        return Ok(dest);
    }

    match document.source_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            let fetched = download_source(url, workdir, download_timeout_secs).await?;
            Ok(fetched.path)
        }
        _ => Err(ReviewError::InputInvalid(format!(
            "document {} has neither a stored file nor a source URL",
            document.id
        ))),
    }
}

/// Normalise `document` to PDF and publish it.
pub async fn normalize(
    document: &Document,
    workdir: &Path,
    store: &BlobStore,
    runner: &Arc<dyn ProcessRunner>,
    config: &ReviewConfig,
) -> Result<Normalized, ReviewError> {
    let original = fetch_original(document, workdir, store, config.download_timeout_secs).await?;
    let key = document_key(document.user_id, document.id, NORMALIZED_FILENAME);

    if extension_of(&original.to_string_lossy()) == ".pdf" {
        let reference = store.put(&original, &key, "application/pdf").await?;
        info!("Document {} already PDF, republished as {}", document.id, reference);
        return Ok(Normalized {
            path: original,
            reference,
            converted: false,
        });
    }

    let pdf = convert_to_pdf(&original, runner, config).await?;
    let reference = store.put(&pdf, &key, "application/pdf").await?;
    info!("Document {} converted to PDF, published as {}", document.id, reference);
    Ok(Normalized {
        path: pdf,
        reference,
        converted: true,
    })
}

/// Run the conversion command and locate its output.
async fn convert_to_pdf(
    input: &Path,
    runner: &Arc<dyn ProcessRunner>,
    config: &ReviewConfig,
) -> Result<PathBuf, ReviewError> {
    let outdir = input
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let input_str = input.to_string_lossy().to_string();
    let outdir_str = outdir.to_string_lossy().to_string();
    let tools_dir = config.tools_dir.to_string_lossy().to_string();
    let failed = |detail: String| ReviewError::ConversionFailed {
        path: input.to_path_buf(),
        detail,
    };

    let output = run_command(
        runner,
        &config.convert_command,
        &[
            ("input", &input_str),
            ("outdir", &outdir_str),
            ("tools_dir", &tools_dir),
        ],
        &outdir,
    )
    .await
    .map_err(|e| failed(e.to_string()))?;

    if !output.success {
        return Err(failed(format!(
            "{} exited with {}: {}",
            config.convert_command.program,
            output.status_line(),
            output.diagnostics()
        )));
    }

    let pdf = input.with_extension("pdf");
    if !tokio::fs::try_exists(&pdf).await.unwrap_or(false) {
        return Err(failed(format!(
            "converter produced no {}",
            pdf.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        )));
    }
    Ok(pdf)
}
