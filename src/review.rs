//! Review entry points: ingest a submission, review it, serve the result.
//!
//! [`DocumentReviewer`] owns the collaborators every stage needs (the
//! repository, the blob store, the process runner and the completion client)
//! and runs the pipeline in order:
//!
//! ```text
//! upload ──▶ Document{uploaded}
//! review_document
//!  ├─ 1. Normalize  fetch original, convert to PDF, publish   → status normalized
//!  ├─ 2. Extract    OCR once, replace text blocks             (fatal on failure)
//!  ├─ 3. Generate   enrich, complete, resolve, retry, fallback
//!  ├─ 4. Persist    review + items
//!  └─ 5. Annotate   overlay and publish                       → status reviewed
//! ```
//!
//! Each run works in its own scratch directory, removed when the run ends
//! however it ends.

use crate::completion::{CompletionClient, LlmCompletionClient};
use crate::config::ReviewConfig;
use crate::error::ReviewError;
use crate::model::{Document, DocumentStatus, RecordId, ReviewOutput, ReviewStats, SourceKind};
use crate::pipeline::annotate::{annotate, ANNOTATED_FILENAME};
use crate::pipeline::enrich::employer_context;
use crate::pipeline::extract::extract_blocks;
use crate::pipeline::generate::{generate_review, GenerateRequest};
use crate::pipeline::input::{download_source, save_upload, UploadedFile};
use crate::pipeline::normalize::normalize;
use crate::process::{ProcessRunner, SystemProcessRunner};
use crate::progress::Stage;
use crate::prompts::PromptContext;
use crate::repository::ReviewRepository;
use crate::storage::{content_type_for_path, document_key, BlobReader, BlobStore, StorageRef};
use chrono::Utc;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{info, warn};

/// File name recorded for remote-doc references, which have no file yet.
const REMOTE_DOC_FILENAME: &str = "google_doc";

// ── Requests ─────────────────────────────────────────────────────────────

/// A new submission.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub user_id: RecordId,
    pub session_id: String,
    /// Client-declared source type (`pdf`, `docx`, `url`, `google_docs`, …).
    /// Blank means `pdf` when a file is attached.
    pub source_kind: String,
    pub source_url: Option<String>,
    pub file: Option<UploadedFile>,
}

/// Per-review context.
#[derive(Debug, Clone, Default)]
pub struct ReviewRequest {
    pub company_name: String,
    pub job_title: String,
    pub candidate_type: String,
    /// Deadline for the network calls (employer context and review
    /// completions). Local processes are not cancelled.
    pub deadline: Option<tokio::time::Instant>,
}

/// The annotated document, ready to stream back to a client.
pub struct AnnotatedArtifact {
    /// Seekable, so range requests can be served.
    pub reader: Box<dyn BlobReader>,
    pub size: u64,
    pub content_type: String,
    pub filename: String,
}

impl fmt::Debug for AnnotatedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotatedArtifact")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .finish()
    }
}

// ── Reviewer ─────────────────────────────────────────────────────────────

/// Runs the review pipeline against a repository and a blob store.
pub struct DocumentReviewer {
    repository: Arc<dyn ReviewRepository>,
    store: Arc<BlobStore>,
    runner: Arc<dyn ProcessRunner>,
    completion: Option<Arc<dyn CompletionClient>>,
    config: ReviewConfig,
}

impl DocumentReviewer {
    /// Reviewer using real processes and the completion provider resolved
    /// from `config`. Without a provider, reviews use the heuristic reviewer.
    pub fn new(
        repository: Arc<dyn ReviewRepository>,
        store: BlobStore,
        config: ReviewConfig,
    ) -> Result<Self, ReviewError> {
        let completion = LlmCompletionClient::from_config(&config)?
            .map(|c| Arc::new(c) as Arc<dyn CompletionClient>);
        Ok(Self {
            repository,
            store: Arc::new(store),
            runner: Arc::new(SystemProcessRunner),
            completion,
            config,
        })
    }

    /// Reviewer from explicit collaborators, with no provider resolution.
    pub fn from_parts(
        repository: Arc<dyn ReviewRepository>,
        store: BlobStore,
        runner: Arc<dyn ProcessRunner>,
        completion: Option<Arc<dyn CompletionClient>>,
        config: ReviewConfig,
    ) -> Self {
        Self {
            repository,
            store: Arc::new(store),
            runner,
            completion,
            config,
        }
    }

    /// Replace the process runner, e.g. to sandbox or fake external tools.
    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the completion client. `None` forces heuristic reviews.
    pub fn with_completion(mut self, completion: Option<Arc<dyn CompletionClient>>) -> Self {
        self.completion = completion;
        self
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn ReviewRepository> {
        &self.repository
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    // ── Upload ───────────────────────────────────────────────────────────

    /// Register a submission and publish its original.
    ///
    /// Remote-doc references are recorded without a stored file; they are
    /// fetched from their URL when reviewed.
    pub async fn upload(&self, request: UploadRequest) -> Result<Document, ReviewError> {
        let url = request
            .source_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        if request.file.is_none() && url.is_none() {
            return Err(ReviewError::InputInvalid(
                "either a file or a source URL is required".into(),
            ));
        }
        self.store.ensure_available()?;

        let source_kind = SourceKind::parse(&request.source_kind, request.file.is_some());
        let scratch = self.scratch_dir("upload_work_")?;

        let (local, filename) = match (&request.file, &source_kind) {
            (Some(file), _) => {
                let path = save_upload(file, scratch.path()).await?;
                let name = file_name_of(&path);
                (Some(path), name)
            }
            (None, SourceKind::RemoteDoc) => (None, REMOTE_DOC_FILENAME.to_string()),
            (None, _) => {
                let url = url.as_deref().unwrap_or_default();
                let fetched =
                    download_source(url, scratch.path(), self.config.download_timeout_secs).await?;
                (Some(fetched.path), fetched.filename)
            }
        };

        let mut document = Document::new(request.user_id, request.session_id, source_kind);
        document.source_url = url;
        document.original_filename = request
            .file
            .as_ref()
            .map(|f| f.filename.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| filename.clone());
        let mut document = self.repository.create_document(document).await?;

        if let Some(path) = local {
            let key = document_key(document.user_id, document.id, &filename);
            let reference = self
                .store
                .put(&path, &key, content_type_for_path(&path))
                .await?;
            document.stored = Some(reference.to_string());
            document.updated_at = Utc::now();
            self.repository.update_document(&document).await?;
        }

        info!(
            "Uploaded document {} for user {} ({:?})",
            document.id, document.user_id, document.source_kind
        );
        Ok(document)
    }

    // ── Review ───────────────────────────────────────────────────────────

    /// Run the full pipeline over document `document_id`.
    ///
    /// # Errors
    /// Only input, storage, conversion, extraction and repository failures
    /// are returned. Generation and annotation problems degrade the result
    /// and are listed in [`ReviewOutput::stage_errors`].
    pub async fn review_document(
        &self,
        document_id: RecordId,
        request: &ReviewRequest,
    ) -> Result<ReviewOutput, ReviewError> {
        let started = Instant::now();
        self.store.ensure_available()?;
        let mut document = self.repository.find_document(document_id).await?;
        let scratch = self.scratch_dir(&format!("review_work_{document_id}_"))?;
        let workdir = scratch.path();
        let mut stage_errors = Vec::new();
        info!("Reviewing document {}", document_id);

        // ── Step 1: Normalize ────────────────────────────────────────────
        let t = self.stage_start(Stage::Normalize);
        let normalized = normalize(&document, workdir, &self.store, &self.runner, &self.config).await?;
        document.normalized = Some(normalized.reference.to_string());
        document.annotated = None;
        document.status = DocumentStatus::Normalized;
        document.updated_at = Utc::now();
        self.repository.update_document(&document).await?;
        self.stage_complete(Stage::Normalize, t);

        // ── Step 2: Extract ──────────────────────────────────────────────
        let t = self.stage_start(Stage::Extract);
        let blocks = extract_blocks(document_id, &normalized.path, &self.runner, &self.config).await?;
        self.repository
            .replace_text_blocks(document_id, blocks.clone())
            .await?;
        self.stage_complete(Stage::Extract, t);

        // ── Step 3: Generate ─────────────────────────────────────────────
        let t = self.stage_start(Stage::Generate);
        let resume_text = blocks
            .iter()
            .map(|b| b.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let enrichment = employer_context(
            &resume_text,
            &request.company_name,
            &request.job_title,
            &self.config,
            self.completion.as_deref(),
            request.deadline,
        )
        .await;
        stage_errors.extend(enrichment.error);

        let generated = generate_review(GenerateRequest {
            blocks: &blocks,
            context: PromptContext {
                company_name: &request.company_name,
                job_title: &request.job_title,
                candidate_type: &request.candidate_type,
                employer_context: &enrichment.context,
            },
            config: &self.config,
            completion: self.completion.as_deref(),
            deadline: request.deadline,
        })
        .await;
        if generated.fallback_used {
            self.stage_degraded(Stage::Generate, "heuristic review used");
        }
        stage_errors.extend(generated.errors.iter().cloned());
        self.stage_complete(Stage::Generate, t);

        // ── Step 4: Persist review ───────────────────────────────────────
        let mut review = generated.review;
        review.document_id = document_id;
        let review = self.repository.create_review(review).await?;
        let items: Vec<_> = generated
            .items
            .into_iter()
            .map(|mut item| {
                item.review_id = review.id;
                item
            })
            .collect();
        self.repository
            .replace_review_items(review.id, items.clone())
            .await?;

        // ── Step 5: Annotate ─────────────────────────────────────────────
        let t = self.stage_start(Stage::Annotate);
        match annotate(
            &document,
            review.id,
            &normalized.path,
            &items,
            workdir,
            &self.store,
            &self.runner,
            &self.config,
        )
        .await
        {
            Ok(reference) => {
                document.annotated = Some(reference.to_string());
                document.status = DocumentStatus::Reviewed;
                document.updated_at = Utc::now();
                self.repository.update_document(&document).await?;
                self.stage_complete(Stage::Annotate, t);
            }
            Err(e) => {
                warn!("Document {} stays normalized: {}", document_id, e);
                self.stage_degraded(Stage::Annotate, &e.to_string());
                stage_errors.push(e);
            }
        }

        let stats = ReviewStats {
            blocks: blocks.len(),
            completion_calls: generated.completion_calls,
            raw_items: generated.raw_items,
            anchored_items: if generated.fallback_used { 0 } else { items.len() },
            dropped_items: generated.dropped_items,
            retried: generated.retried,
            fallback_used: generated.fallback_used,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Review of document {} complete: score {}, {} items ({} dropped, fallback: {}), {}ms",
            document_id,
            review.score,
            items.len(),
            stats.dropped_items,
            stats.fallback_used,
            stats.duration_ms
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_review_complete(items.len());
        }

        Ok(ReviewOutput {
            document,
            review,
            items,
            stats,
            stage_errors,
        })
    }

    // ── Served artifact ──────────────────────────────────────────────────

    /// Open the annotated document of `document_id` for streaming.
    pub async fn open_annotated(&self, document_id: RecordId) -> Result<AnnotatedArtifact, ReviewError> {
        let document = self.repository.find_document(document_id).await?;
        let raw = document
            .annotated
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ReviewError::NotFound("annotated file not ready".into()))?;
        let reference = StorageRef::parse(raw)?;
        let stream = self.store.open_stream(&reference).await?;

        let content_type = match stream.content_type.trim() {
            "" | "application/octet-stream" => "application/pdf".to_string(),
            ct => ct.to_string(),
        };
        let filename = Some(reference.file_name())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| ANNOTATED_FILENAME.to_string());
        Ok(AnnotatedArtifact {
            reader: stream.reader,
            size: stream.size,
            content_type,
            filename,
        })
    }

    // ── Progress ─────────────────────────────────────────────────────────

    fn stage_start(&self, stage: Stage) -> Instant {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_start(stage);
        }
        Instant::now()
    }

    fn stage_complete(&self, stage: Stage, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!("Stage {} done in {}ms", stage, elapsed_ms);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_complete(stage, elapsed_ms);
        }
    }

    fn stage_degraded(&self, stage: Stage, reason: &str) {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_degraded(stage, reason);
        }
    }

    /// A fresh scratch directory, removed when the returned guard drops.
    fn scratch_dir(&self, prefix: &str) -> Result<TempDir, ReviewError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match self.config.scratch_root {
            Some(ref root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| ReviewError::Internal(format!("cannot create scratch directory: {e}")))
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "original".to_string())
}
