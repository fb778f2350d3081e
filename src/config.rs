//! Configuration types for document review.
//!
//! All review behaviour is controlled through [`ReviewConfig`], built via its
//! [`ReviewConfigBuilder`]. Blob-store settings live separately in
//! [`StorageConfig`] because they are normally shared by every service in the
//! host process, while review settings may vary per request.

use crate::error::ReviewError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one review pipeline.
///
/// # Example
/// ```rust
/// use edgequake_docreview::ReviewConfig;
///
/// let config = ReviewConfig::builder()
///     .temperature(0.2)
///     .min_anchored_items(3)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ReviewConfig {
    /// LLM model identifier. If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Model used only for the review calls, overriding `model`.
    pub review_model: Option<String>,

    /// Sampling temperature for review calls. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens per review call. Default: 900.
    ///
    /// Eight items with a quote, a message and a suggestion fit comfortably;
    /// anything larger mostly buys longer summaries.
    pub max_tokens: usize,

    /// Per-completion-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Character budget for the block listing in the first review prompt. Default: 30 000.
    pub prompt_char_budget: usize,

    /// Anchored items below which the narrowed retry prompt is issued. Default: 3.
    pub min_anchored_items: usize,

    /// Blocks enumerated in the retry prompt. Default: 40.
    pub retry_block_cap: usize,

    /// Maximum items produced by the heuristic reviewer. Default: 8.
    pub max_heuristic_items: usize,

    /// Base URL of the employer-context report service (`RAG_REVIEW_URL`).
    pub enrichment_url: Option<String>,

    /// Timeout for the employer-context report service in seconds. Default: 45.
    pub enrichment_timeout_secs: u64,

    /// Download timeout for remote sources in seconds. Default: 30.
    pub download_timeout_secs: u64,

    /// Directory holding the OCR and annotation scripts, substituted for
    /// `{tools_dir}` in every command. Commands run inside a per-review
    /// scratch directory, so relative script paths would not resolve; the
    /// builder makes this absolute. Default: `<cwd>/scripts`.
    pub tools_dir: PathBuf,

    /// Parent of the per-run scratch directories. Default: the system
    /// temporary directory.
    pub scratch_root: Option<PathBuf>,

    /// Converts non-PDF input to PDF. Placeholders: `{input}`, `{outdir}`.
    pub convert_command: CommandSpec,

    /// Runs OCR and prints the block payload on stdout. Placeholder: `{input}`.
    pub ocr_command: CommandSpec,

    /// Draws overlays. Placeholders: `{input}`, `{output}`, `{items}`.
    pub annotate_command: CommandSpec,

    /// Stage progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            review_model: None,
            temperature: 0.2,
            max_tokens: 900,
            api_timeout_secs: 60,
            prompt_char_budget: 30_000,
            min_anchored_items: 3,
            retry_block_cap: 40,
            max_heuristic_items: 8,
            enrichment_url: None,
            enrichment_timeout_secs: 45,
            download_timeout_secs: 30,
            tools_dir: absolute(PathBuf::from("scripts")),
            scratch_root: None,
            convert_command: CommandSpec::new(
                "soffice",
                ["--headless", "--convert-to", "pdf", "--outdir", "{outdir}", "{input}"],
            ),
            ocr_command: CommandSpec::new(
                "python3",
                ["{tools_dir}/ocr_extract.py", "--input", "{input}"],
            ),
            annotate_command: CommandSpec::new(
                "python3",
                [
                    "{tools_dir}/annotate_pdf.py",
                    "--input",
                    "{input}",
                    "--output",
                    "{output}",
                    "--items",
                    "{items}",
                ],
            ),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ReviewConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("review_model", &self.review_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("min_anchored_items", &self.min_anchored_items)
            .field("enrichment_url", &self.enrichment_url)
            .field("tools_dir", &self.tools_dir)
            .field("scratch_root", &self.scratch_root)
            .field("convert_command", &self.convert_command)
            .field("ocr_command", &self.ocr_command)
            .field("annotate_command", &self.annotate_command)
            .finish()
    }
}

impl ReviewConfig {
    /// Create a new builder for `ReviewConfig`.
    pub fn builder() -> ReviewConfigBuilder {
        ReviewConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults overlaid with `RAG_REVIEW_URL`, `OPENAI_REVIEW_MODEL`,
    /// `EDGEQUAKE_LLM_PROVIDER`, `EDGEQUAKE_MODEL` and `DOCREVIEW_TOOLS_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = non_empty_env("DOCREVIEW_TOOLS_DIR") {
            config.tools_dir = absolute(PathBuf::from(dir));
        }
        config.enrichment_url = non_empty_env("RAG_REVIEW_URL");
        config.review_model = non_empty_env("OPENAI_REVIEW_MODEL");
        config.provider_name = non_empty_env("EDGEQUAKE_LLM_PROVIDER");
        config.model = non_empty_env("EDGEQUAKE_MODEL");
        config
    }
}

/// Builder for [`ReviewConfig`].
#[derive(Debug)]
pub struct ReviewConfigBuilder {
    config: ReviewConfig,
}

impl ReviewConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn review_model(mut self, model: impl Into<String>) -> Self {
        self.config.review_model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn prompt_char_budget(mut self, chars: usize) -> Self {
        self.config.prompt_char_budget = chars;
        self
    }

    pub fn min_anchored_items(mut self, n: usize) -> Self {
        self.config.min_anchored_items = n;
        self
    }

    pub fn retry_block_cap(mut self, n: usize) -> Self {
        self.config.retry_block_cap = n;
        self
    }

    pub fn max_heuristic_items(mut self, n: usize) -> Self {
        self.config.max_heuristic_items = n;
        self
    }

    pub fn enrichment_url(mut self, url: impl Into<String>) -> Self {
        self.config.enrichment_url = Some(url.into());
        self
    }

    pub fn enrichment_timeout_secs(mut self, secs: u64) -> Self {
        self.config.enrichment_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Relative directories are resolved against the current directory.
    pub fn tools_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tools_dir = absolute(dir.into());
        self
    }

    pub fn scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = Some(dir.into());
        self
    }

    pub fn convert_command(mut self, cmd: CommandSpec) -> Self {
        self.config.convert_command = cmd;
        self
    }

    pub fn ocr_command(mut self, cmd: CommandSpec) -> Self {
        self.config.ocr_command = cmd;
        self
    }

    pub fn annotate_command(mut self, cmd: CommandSpec) -> Self {
        self.config.annotate_command = cmd;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ReviewConfig, ReviewError> {
        let c = &self.config;
        if c.max_tokens == 0 {
            return Err(ReviewError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(ReviewError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.retry_block_cap == 0 || c.max_heuristic_items == 0 {
            return Err(ReviewError::InvalidConfig(
                "retry_block_cap and max_heuristic_items must be ≥ 1".into(),
            ));
        }
        for (name, cmd) in [
            ("convert", &c.convert_command),
            ("ocr", &c.ocr_command),
            ("annotate", &c.annotate_command),
        ] {
            if cmd.program.trim().is_empty() {
                return Err(ReviewError::InvalidConfig(format!(
                    "{name} command has no program"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── External commands ────────────────────────────────────────────────────

/// An external command template.
///
/// Arguments may contain `{name}` placeholders that are substituted per
/// invocation by [`CommandSpec::render`]. Every command gets `{tools_dir}`;
/// the other placeholders depend on the stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute placeholders in every argument.
    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{name}}}"), value)
                })
            })
            .collect()
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

/// Blob-store settings.
///
/// With no `bucket`, artifacts are kept under `local_root` on the local file
/// system. With a bucket, every artifact is pushed to the S3-compatible store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Durable directory for local-only mode. Default: `storage`.
    pub local_root: PathBuf,
    /// Remote bucket (`AWS_S3_BUCKET`).
    pub bucket: Option<String>,
    /// Remote region (`AWS_REGION`); required when `bucket` is set.
    pub region: Option<String>,
    /// Key prefix inside the bucket (`AWS_S3_PREFIX`).
    pub prefix: String,
    /// Custom S3 endpoint, e.g. MinIO (`AWS_ENDPOINT_URL`).
    pub endpoint: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::local("storage")
    }
}

impl StorageConfig {
    /// Local-only storage rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: root.into(),
            bucket: None,
            region: None,
            prefix: String::new(),
            endpoint: None,
        }
    }

    /// S3 storage in `bucket`/`region`.
    pub fn s3(bucket: &str, region: &str) -> Self {
        Self {
            bucket: Some(bucket.to_string()),
            region: Some(region.to_string()),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim().trim_matches('/').to_string();
        self
    }

    /// Load configuration from environment variables.
    ///
    /// - `AWS_S3_BUCKET`: bucket name; absent means local-only mode
    /// - `AWS_REGION`: region, required with a bucket
    /// - `AWS_S3_PREFIX`: optional key prefix
    /// - `AWS_ENDPOINT_URL`: optional custom endpoint
    /// - `DOCREVIEW_STORAGE_DIR`: local root (default `storage`)
    pub fn from_env() -> Self {
        let local_root = non_empty_env("DOCREVIEW_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("storage"));
        Self {
            local_root,
            bucket: non_empty_env("AWS_S3_BUCKET"),
            region: non_empty_env("AWS_REGION"),
            prefix: non_empty_env("AWS_S3_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_default(),
            endpoint: non_empty_env("AWS_ENDPOINT_URL"),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.bucket.is_some()
    }
}

/// `path` joined onto the current directory when relative.
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
