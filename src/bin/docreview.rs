//! CLI binary for edgequake-docreview.
//!
//! A thin shim over the library crate: uploads one local file or URL into an
//! in-memory repository, reviews it and prints the result.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_docreview::{
    BlobStore, DocumentReviewer, InMemoryRepository, ProgressCallback, ReviewConfig,
    ReviewOutput, ReviewProgressCallback, ReviewRequest, Severity, Stage, StorageConfig,
    UploadRequest, UploadedFile,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner that names the running stage and logs one line per stage.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Reviewing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ReviewProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_message(format!("{stage}…"));
    }

    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<10} {}",
            green("✓"),
            stage,
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0))
        ));
    }

    fn on_stage_degraded(&self, stage: Stage, reason: &str) {
        self.bar
            .println(format!("  {} {:<10} {}", yellow("⚠"), stage, yellow(reason)));
    }

    fn on_review_complete(&self, item_count: usize) {
        self.bar.finish_and_clear();
        eprintln!("{} {} review items", green("✔"), bold(&item_count.to_string()));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Review a local PDF
  docreview cv.pdf

  # Review against a specific employer and save the annotated copy
  docreview cv.docx --company "Acme" --job-title "Backend engineer" -o cv.annotated.pdf

  # Review a document served over HTTP, JSON output
  docreview https://example.com/entry-sheet.pdf --json > review.json

EXTERNAL TOOLS:
  soffice      converts non-PDF input (LibreOffice, headless)
  python3      runs ocr_extract.py and annotate_pdf.py from --tools-dir

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  OPENAI_REVIEW_MODEL     Model used for review calls only
  RAG_REVIEW_URL          Employer-context report service
  AWS_S3_BUCKET           Push artifacts to this bucket (with AWS_REGION)
  DOCREVIEW_STORAGE_DIR   Local artifact directory (default: storage)
  DOCREVIEW_TOOLS_DIR     OCR and annotation scripts (default: ./scripts)

Without any provider the review still runs, using keyword heuristics.
"#;

/// Review résumés and entry sheets and annotate the original document.
#[derive(Parser, Debug)]
#[command(
    name = "docreview",
    version,
    about = "Review résumés and entry sheets with an LLM and annotate the original document",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file path (PDF, DOCX, …) or HTTP/HTTPS URL.
    input: String,

    /// Company the document is addressed to.
    #[arg(long, env = "DOCREVIEW_COMPANY", default_value = "")]
    company: String,

    /// Position applied for.
    #[arg(long, env = "DOCREVIEW_JOB_TITLE", default_value = "")]
    job_title: String,

    /// Candidate type, e.g. "new graduate" or "mid-career".
    #[arg(long, env = "DOCREVIEW_CANDIDATE_TYPE", default_value = "")]
    candidate_type: String,

    /// Directory for published artifacts in local-only mode.
    #[arg(long, env = "DOCREVIEW_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Directory holding ocr_extract.py and annotate_pdf.py.
    #[arg(long, env = "DOCREVIEW_TOOLS_DIR")]
    tools_dir: Option<PathBuf>,

    /// Write the annotated PDF to this file.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Overall deadline for the completion calls, in seconds.
    #[arg(long)]
    deadline: Option<u64>,

    /// Output structured JSON (ReviewOutput) instead of text.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long)]
    no_progress: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build reviewer ───────────────────────────────────────────────────
    let show_progress = !cli.no_progress && !cli.json && cli.verbose == 0;
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ReviewProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;

    let mut storage = StorageConfig::from_env();
    if let Some(ref dir) = cli.storage_dir {
        storage.local_root = dir.clone();
    }
    let reviewer = DocumentReviewer::new(
        Arc::new(InMemoryRepository::new()),
        BlobStore::from_config(&storage),
        config,
    )
    .context("Failed to set up reviewer")?;

    // ── Upload + review ──────────────────────────────────────────────────
    let upload = upload_request(&cli.input).await?;
    let document = reviewer.upload(upload).await.context("Upload failed")?;
    let request = ReviewRequest {
        company_name: cli.company.clone(),
        job_title: cli.job_title.clone(),
        candidate_type: cli.candidate_type.clone(),
        deadline: cli
            .deadline
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs)),
    };
    let output = reviewer
        .review_document(document.id, &request)
        .await
        .context("Review failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        print_review(&output);
    }

    // ── Annotated artifact ───────────────────────────────────────────────
    if let Some(ref path) = cli.output {
        write_annotated(&reviewer, document.id, path).await?;
        if !cli.json {
            eprintln!("{} annotated copy → {}", green("✔"), bold(&path.display().to_string()));
        }
    }

    Ok(())
}

/// Map CLI args to `ReviewConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ReviewConfig> {
    let base = ReviewConfig::from_env();
    let tools_dir = cli.tools_dir.clone().unwrap_or(base.tools_dir);
    let mut builder = ReviewConfig::builder().tools_dir(tools_dir);
    if let Some(model) = cli.model.clone().or(base.model) {
        builder = builder.model(model);
    }
    if let Some(provider) = cli.provider.clone().or(base.provider_name) {
        builder = builder.provider_name(provider);
    }
    if let Some(model) = base.review_model {
        builder = builder.review_model(model);
    }
    if let Some(url) = base.enrichment_url {
        builder = builder.enrichment_url(url);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

async fn upload_request(input: &str) -> Result<UploadRequest> {
    if input.starts_with("http://") || input.starts_with("https://") {
        return Ok(UploadRequest {
            user_id: 1,
            session_id: "cli".into(),
            source_kind: "url".into(),
            source_url: Some(input.to_string()),
            file: None,
        });
    }
    let path = Path::new(input);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let source_kind = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    Ok(UploadRequest {
        user_id: 1,
        session_id: "cli".into(),
        source_kind,
        source_url: None,
        file: Some(UploadedFile { filename, bytes }),
    })
}

fn print_review(output: &ReviewOutput) {
    println!(
        "{}  {}",
        bold(&format!("Score {}/100", output.review.score)),
        output.review.summary
    );
    println!();
    for item in &output.items {
        let severity = match item.severity {
            Severity::Critical => red("critical"),
            Severity::Warning => yellow("warning "),
            Severity::Info => dim("info    "),
        };
        println!("  p{:<2} {}  {}", item.page_number, severity, item.message);
        if let Some(ref suggestion) = item.suggestion {
            println!("       {}", dim(&format!("→ {suggestion}")));
        }
    }
    let stats = &output.stats;
    eprintln!();
    eprintln!(
        "{}",
        dim(&format!(
            "{} blocks, {} completion calls, {} anchored / {} dropped{}{}, {}ms",
            stats.blocks,
            stats.completion_calls,
            stats.anchored_items,
            stats.dropped_items,
            if stats.retried { ", retried" } else { "" },
            if stats.fallback_used { ", heuristic" } else { "" },
            stats.duration_ms
        ))
    );
    for err in &output.stage_errors {
        eprintln!("{} {}", yellow("⚠"), err);
    }
}

async fn write_annotated(reviewer: &DocumentReviewer, document_id: u64, path: &Path) -> Result<()> {
    let mut artifact = reviewer
        .open_annotated(document_id)
        .await
        .context("Annotated document is not available")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    tokio::io::copy(&mut artifact.reader, &mut file)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
