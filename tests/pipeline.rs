//! Integration tests for the review pipeline.
//!
//! External tools and the completion service are replaced by in-test fakes,
//! so these run offline and without LibreOffice, OCR models or API keys.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use edgequake_docreview::{
    BlobStore, CompletionClient, CompletionError, DocumentReviewer, DocumentStatus,
    InMemoryRepository, ProcessOutput, ProcessRunner, ReviewConfig, ReviewRepository,
    ReviewRequest, StorageRef, UploadRequest, UploadedFile,
};
use object_store::memory::InMemory;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

// ── Test helpers ─────────────────────────────────────────────────────────────

static TRACING: Once = Once::new();

/// Route pipeline logs to the test harness; `RUST_LOG=debug` shows them.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

const TWO_PAGE_OCR: &str = r#"{"pages":[
    {"page_number":1,"width":1240,"height":1754,"blocks":[
        {"block_index":1,"text":"I led a team of 5 to ship X","bbox":[80,120,900,160]},
        {"block_index":2,"text":"Skills: Go, SQL","bbox":[80,200,600,240]}]},
    {"page_number":2,"width":1240,"height":1754,"blocks":[]}]}"#;

/// Completion fake replaying canned JSON answers in order.
#[derive(Default)]
struct Scripted {
    answers: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<String>>,
}

impl Scripted {
    fn new<I: IntoIterator<Item = &'static str>>(answers: I) -> Arc<Self> {
        let s = Self::default();
        s.answers
            .lock()
            .unwrap()
            .extend(answers.into_iter().map(|a| Ok(a.to_string())));
        Arc::new(s)
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionClient for Scripted {
    async fn complete_json(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _temperature: f32,
        _max_tokens: usize,
    ) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(user_prompt.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CompletionError::Empty))
    }

    async fn complete_text(&self, prompt: &str) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Err(CompletionError::Provider("not scripted".into()))
    }
}

/// Fake external tools: `soffice` writes `<stem>.pdf`, OCR prints a fixed
/// payload, the annotator copies its input. The tool named by `failing`
/// exits non-zero instead.
struct FakeTools {
    ocr: &'static str,
    failing: Option<&'static str>,
    invocations: Mutex<Vec<String>>,
    workdirs: Mutex<Vec<PathBuf>>,
}

impl FakeTools {
    fn new(ocr: &'static str) -> Arc<Self> {
        Arc::new(Self {
            ocr,
            failing: None,
            invocations: Mutex::new(Vec::new()),
            workdirs: Mutex::new(Vec::new()),
        })
    }

    fn failing(tool: &'static str) -> Arc<Self> {
        Arc::new(Self {
            ocr: TWO_PAGE_OCR,
            failing: Some(tool),
            invocations: Mutex::new(Vec::new()),
            workdirs: Mutex::new(Vec::new()),
        })
    }

    fn workdirs(&self) -> Vec<PathBuf> {
        self.workdirs.lock().unwrap().clone()
    }

    fn count(&self, tool: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|t| *t == tool)
            .count()
    }
}

fn flag<'a>(args: &'a [String], name: &str) -> &'a str {
    &args[args.iter().position(|a| a == name).unwrap() + 1]
}

fn ok(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        success: true,
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

impl ProcessRunner for FakeTools {
    fn run(&self, program: &str, args: &[String], workdir: &Path) -> io::Result<ProcessOutput> {
        let tool = if program == "soffice" {
            "convert"
        } else if args.iter().any(|a| a == "--items") {
            "annotate"
        } else {
            "ocr"
        };
        self.invocations.lock().unwrap().push(tool.to_string());
        self.workdirs.lock().unwrap().push(workdir.to_path_buf());

        if self.failing == Some(tool) {
            return Ok(ProcessOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: format!("{tool} crashed"),
            });
        }
        match tool {
            "convert" => {
                let input = Path::new(args.last().unwrap());
                std::fs::write(input.with_extension("pdf"), b"%PDF converted")?;
            }
            "annotate" => {
                std::fs::copy(flag(args, "--input"), flag(args, "--output"))?;
            }
            _ => {}
        }
        Ok(ok(if tool == "ocr" { self.ocr } else { "" }))
    }
}

fn reviewer(
    store: BlobStore,
    tools: Arc<FakeTools>,
    completion: Option<Arc<Scripted>>,
    config: ReviewConfig,
) -> (DocumentReviewer, Arc<InMemoryRepository>) {
    init_tracing();
    let repository = Arc::new(InMemoryRepository::new());
    let reviewer = DocumentReviewer::from_parts(
        repository.clone(),
        store,
        tools,
        completion.map(|c| c as Arc<dyn CompletionClient>),
        config,
    );
    (reviewer, repository)
}

fn upload(filename: &str, bytes: &[u8]) -> UploadRequest {
    UploadRequest {
        user_id: 7,
        session_id: "session".into(),
        file: Some(UploadedFile {
            filename: filename.into(),
            bytes: bytes.to_vec(),
        }),
        ..Default::default()
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn quoted_item_lands_on_its_block() {
    let root = TempDir::new().unwrap();
    let completion = Scripted::new([
        r#"{"score":78,"summary":"Clear","items":[{"quote":"led a team of 5","message":"What was X?","suggestion":"Name the product and its users","severity":"warning","page_hint":1}]}"#,
        r#"{"items":[]}"#,
    ]);
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(TWO_PAGE_OCR),
        Some(completion.clone()),
        ReviewConfig::default(),
    );

    let doc = r.upload(upload("cv.pdf", b"%PDF-1.7")).await.unwrap();
    let out = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();

    assert_eq!(out.items.len(), 1);
    let item = &out.items[0];
    assert_eq!(item.page_number, 1);
    assert_eq!(item.bbox.corners(), [80.0, 120.0, 900.0, 160.0]);
    assert_eq!((item.bbox.page_width, item.bbox.page_height), (1240, 1754));
    assert_eq!(item.message, "What was X?");
    // one anchored item is below the default minimum of 3, so one retry ran;
    // the empty retry does not displace the first pass
    assert_eq!(completion.calls(), 2);
    assert!(out.stats.retried);
    assert_eq!(out.review.score, 78);
}

#[tokio::test]
async fn completion_is_called_at_most_twice() {
    let root = TempDir::new().unwrap();
    let junk = r#"{"score":50,"items":[{"quote":"text that is nowhere in the document","message":"m"}]}"#;
    let completion = Scripted::new([junk, junk, junk]);
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(TWO_PAGE_OCR),
        Some(completion.clone()),
        ReviewConfig::default(),
    );

    let doc = r.upload(upload("cv.pdf", b"%PDF-1.7")).await.unwrap();
    let out = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();

    assert_eq!(completion.calls(), 2);
    assert_eq!(out.stats.completion_calls, 2);
    assert!(out.stats.fallback_used);
    assert_eq!(out.stats.dropped_items, 2);
    assert!(!out.items.is_empty());
}

#[tokio::test]
async fn every_item_box_belongs_to_a_block() {
    let root = TempDir::new().unwrap();
    let (r, repo) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(TWO_PAGE_OCR),
        None,
        ReviewConfig::default(),
    );

    let doc = r.upload(upload("cv.pdf", b"%PDF-1.7")).await.unwrap();
    let out = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();

    let blocks = repo.find_text_blocks(doc.id).await.unwrap();
    assert_eq!(blocks.len(), 2);
    assert!(!out.items.is_empty());
    for item in &out.items {
        assert!(
            blocks
                .iter()
                .any(|b| b.bbox == item.bbox && b.page_number == item.page_number),
            "item {item:?} is not on any block"
        );
    }
}

#[tokio::test]
async fn document_without_blocks_still_gets_one_item() {
    let root = TempDir::new().unwrap();
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(r#"{"pages":[{"page_number":1,"width":100,"height":100,"blocks":[]}]}"#),
        Some(Arc::new(Scripted::default())),
        ReviewConfig::default(),
    );

    let doc = r.upload(upload("blank.pdf", b"%PDF-1.7")).await.unwrap();
    let out = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();
    assert_eq!(out.items.len(), 1);
    assert_eq!(out.items[0].bbox.corners(), [20.0, 20.0, 260.0, 80.0]);
    assert_eq!(out.stats.completion_calls, 0);
}

#[tokio::test]
async fn renormalizing_a_pdf_is_a_pure_copy() {
    let root = TempDir::new().unwrap();
    let tools = FakeTools::new(TWO_PAGE_OCR);
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        tools.clone(),
        None,
        ReviewConfig::default(),
    );
    let original = b"%PDF-1.7 exact bytes \x00\x01\x02";
    let doc = r.upload(upload("cv.pdf", original)).await.unwrap();

    let first = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();
    let first_bytes = std::fs::read(first.document.normalized.as_ref().unwrap()).unwrap();
    let second = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();
    let second_bytes = std::fs::read(second.document.normalized.as_ref().unwrap()).unwrap();

    assert_eq!(first_bytes, original);
    assert_eq!(second_bytes, first_bytes);
    assert_eq!(tools.count("convert"), 0);
}

#[tokio::test]
async fn docx_is_converted_before_ocr() {
    let root = TempDir::new().unwrap();
    let tools = FakeTools::new(TWO_PAGE_OCR);
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        tools.clone(),
        None,
        ReviewConfig::default(),
    );

    let doc = r.upload(upload("cv.docx", b"PK\x03\x04")).await.unwrap();
    let out = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();

    assert_eq!(tools.count("convert"), 1);
    assert_eq!(tools.count("ocr"), 1);
    let normalized = out.document.normalized.unwrap();
    assert!(normalized.ends_with("normalized.pdf"));
    assert_eq!(std::fs::read(normalized).unwrap(), b"%PDF converted");
}

#[tokio::test]
async fn remote_store_round_trip() {
    let root = TempDir::new().unwrap();
    let store = BlobStore::with_object_store(
        Arc::new(InMemory::new()),
        "s3",
        "resumes-bucket",
        "prod",
        root.path(),
    );
    let (r, _) = reviewer(store, FakeTools::new(TWO_PAGE_OCR), None, ReviewConfig::default());

    let doc = r.upload(upload("cv.pdf", b"%PDF-1.7 remote")).await.unwrap();
    let stored = StorageRef::parse(doc.stored.as_deref().unwrap()).unwrap();
    assert!(stored.is_remote());
    assert_eq!(
        stored.to_string(),
        format!("s3://resumes-bucket/prod/resumes/7/{}/original.pdf", doc.id)
    );

    let out = r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();
    assert_eq!(out.document.status, DocumentStatus::Reviewed);
    assert!(out.document.annotated.as_deref().unwrap().starts_with("s3://resumes-bucket/"));

    let mut artifact = r.open_annotated(doc.id).await.unwrap();
    let mut body = Vec::new();
    artifact.reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"%PDF-1.7 remote");
    assert_eq!(artifact.content_type, "application/pdf");
}

#[tokio::test]
async fn concurrent_reviews_of_one_document_both_succeed() {
    let root = TempDir::new().unwrap();
    let (r, repo) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(TWO_PAGE_OCR),
        None,
        ReviewConfig::default(),
    );
    let doc = r.upload(upload("cv.pdf", b"%PDF-1.7")).await.unwrap();
    let request = ReviewRequest::default();

    let (a, b) = tokio::join!(
        r.review_document(doc.id, &request),
        r.review_document(doc.id, &request)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.review.id, b.review.id);

    // last write wins: exactly one review survives, with its own items
    let surviving = repo.review_for_document(doc.id).unwrap();
    assert!(surviving.id == a.review.id || surviving.id == b.review.id);
    let items = repo.find_review_items(surviving.id).await.unwrap();
    assert!(!items.is_empty());
    assert!(items.iter().all(|i| i.review_id == surviving.id));
}

#[tokio::test]
async fn url_source_is_downloaded_at_upload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await.unwrap();
        let body = b"%PDF-1.7 from the web";
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/pdf\r\n\
             content-disposition: attachment; filename=\"entry_sheet.pdf\"\r\n\
             content-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
    });

    let root = TempDir::new().unwrap();
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(TWO_PAGE_OCR),
        None,
        ReviewConfig::default(),
    );
    let doc = r
        .upload(UploadRequest {
            user_id: 3,
            source_kind: "url".into(),
            source_url: Some(format!("http://{addr}/download?id=1")),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(doc.original_filename, "entry_sheet.pdf");
    let stored = doc.stored.unwrap();
    assert!(stored.ends_with("entry_sheet.pdf"));
    assert_eq!(std::fs::read(stored).unwrap(), b"%PDF-1.7 from the web");
}

#[tokio::test]
async fn unknown_document_is_not_found() {
    let root = TempDir::new().unwrap();
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(TWO_PAGE_OCR),
        None,
        ReviewConfig::default(),
    );
    let err = r
        .review_document(999, &ReviewRequest::default())
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Not found"));
}

// ── Scratch space ────────────────────────────────────────────────────────────

fn scratch_config(scratch: &TempDir) -> ReviewConfig {
    ReviewConfig::builder()
        .scratch_root(scratch.path())
        .build()
        .unwrap()
}

fn assert_no_scratch_left(scratch: &TempDir, tools: &FakeTools) {
    let left: Vec<_> = std::fs::read_dir(scratch.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert!(left.is_empty(), "scratch entries left behind: {left:?}");
    for dir in tools.workdirs() {
        assert!(dir.starts_with(scratch.path()), "{dir:?} is outside the scratch root");
        assert!(!dir.exists(), "{dir:?} still exists");
    }
}

#[tokio::test]
async fn upload_leaves_no_scratch_dir() {
    let root = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let tools = FakeTools::new(TWO_PAGE_OCR);
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        tools.clone(),
        None,
        scratch_config(&scratch),
    );

    r.upload(upload("cv.pdf", b"%PDF-1.7")).await.unwrap();
    assert_no_scratch_left(&scratch, &tools);

    let err = r.upload(UploadRequest::default()).await.unwrap_err();
    assert!(err.to_string().contains("Invalid input"), "{err}");
    assert_no_scratch_left(&scratch, &tools);
}

#[tokio::test]
async fn successful_review_removes_its_workdir() {
    let root = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let tools = FakeTools::new(TWO_PAGE_OCR);
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        tools.clone(),
        None,
        scratch_config(&scratch),
    );

    let doc = r.upload(upload("cv.docx", b"PK\x03\x04")).await.unwrap();
    r.review_document(doc.id, &ReviewRequest::default()).await.unwrap();

    assert_eq!(tools.workdirs().len(), 3);
    assert_no_scratch_left(&scratch, &tools);
}

#[tokio::test]
async fn failed_conversion_removes_its_workdir() {
    let root = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let tools = FakeTools::failing("convert");
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        tools.clone(),
        None,
        scratch_config(&scratch),
    );

    let doc = r.upload(upload("cv.docx", b"PK\x03\x04")).await.unwrap();
    let err = r
        .review_document(doc.id, &ReviewRequest::default())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("convert crashed"), "{err}");
    assert_eq!(tools.workdirs().len(), 1);
    assert_no_scratch_left(&scratch, &tools);
}

#[tokio::test]
async fn failed_extraction_removes_its_workdir() {
    let root = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let tools = FakeTools::failing("ocr");
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        tools.clone(),
        None,
        scratch_config(&scratch),
    );

    let doc = r.upload(upload("cv.pdf", b"%PDF-1.7")).await.unwrap();
    let err = r
        .review_document(doc.id, &ReviewRequest::default())
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("Text extraction failed"), "{err}");
    assert_eq!(tools.workdirs().len(), 1);
    assert_no_scratch_left(&scratch, &tools);
}

// ── Deadline ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_deadline_makes_no_completion_calls() {
    let root = TempDir::new().unwrap();
    let completion = Arc::new(Scripted::default());
    let (r, _) = reviewer(
        BlobStore::local(root.path()),
        FakeTools::new(TWO_PAGE_OCR),
        Some(completion.clone()),
        ReviewConfig::default(),
    );
    let doc = r.upload(upload("cv.pdf", b"%PDF-1.7")).await.unwrap();
    let request = ReviewRequest {
        company_name: "Acme".into(),
        deadline: Some(Instant::now()),
        ..Default::default()
    };

    let out = r.review_document(doc.id, &request).await.unwrap();

    assert_eq!(completion.calls(), 0);
    assert_eq!(out.stats.completion_calls, 0);
    assert!(out.stats.fallback_used);
    assert!(out
        .stage_errors
        .iter()
        .any(|e| e.to_string().contains("deadline exceeded")));
}
