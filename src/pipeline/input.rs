//! Ingestion helpers: put a submitted file into the scratch directory.
//!
//! A submission is either uploaded bytes or a URL. Uploaded bytes are
//! written as `original<.ext>`; URLs are downloaded with a bounded timeout
//! and named after the server's `Content-Disposition`, the URL path, or
//! `document`, in that order. A name without an extension gets `.pdf`, the
//! format nearly every remote source serves.

use crate::error::ReviewError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Raw bytes of a file submitted with an upload request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// A source materialised in a scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    pub path: PathBuf,
    pub filename: String,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Lower-cased extension including the dot, or empty.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Write uploaded bytes to `dir/original<.ext>`.
pub async fn save_upload(file: &UploadedFile, dir: &Path) -> Result<PathBuf, ReviewError> {
    if file.bytes.is_empty() {
        return Err(ReviewError::InputInvalid(format!(
            "uploaded file '{}' is empty",
            file.filename
        )));
    }
    let path = dir.join(format!("original{}", extension_of(&file.filename)));
    tokio::fs::write(&path, &file.bytes).await?;
    debug!("Saved upload '{}' to {}", file.filename, path.display());
    Ok(path)
}

/// Download `url` into `dir`.
pub async fn download_source(
    url: &str,
    dir: &Path,
    timeout_secs: u64,
) -> Result<FetchedSource, ReviewError> {
    info!("Downloading source from: {}", url);
    let fail = |reason: String| ReviewError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    if !is_url(url) {
        return Err(fail("only http and https URLs are supported".into()));
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| fail(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            fail(format!("timed out after {timeout_secs}s"))
        } else {
            fail(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(fail(format!("HTTP {}", response.status())));
    }

    let disposition = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let filename = filename_for_download(url, disposition.as_deref());

    let bytes = response.bytes().await.map_err(|e| fail(e.to_string()))?;
    let path = dir.join(&filename);
    tokio::fs::write(&path, &bytes).await?;

    info!("Downloaded {} bytes to: {}", bytes.len(), path.display());
    Ok(FetchedSource { path, filename })
}

/// Pick a file name for a downloaded source.
pub fn filename_for_download(url: &str, content_disposition: Option<&str>) -> String {
    let from_header = content_disposition
        .and_then(|d| d.split("filename=").nth(1))
        .map(|rest| rest.split(';').next().unwrap_or(rest))
        .map(|name| name.trim().trim_matches('"').to_string());

    let from_url = || {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.path_segments()?.next_back().map(str::to_string))
    };

    let raw = from_header
        .filter(|n| !n.is_empty())
        .or_else(from_url)
        .unwrap_or_default();

    // Never let a server-supplied name escape the scratch directory.
    let mut name = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        name = "document".to_string();
    }
    if extension_of(&name).is_empty() {
        name.push_str(".pdf");
    }
    name
}
