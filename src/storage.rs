//! Blob storage: one reference type, two backends.
//!
//! Every artifact the pipeline creates is written to the scratch directory
//! first and then pushed through [`BlobStore::put`], which returns a
//! [`StorageRef`]. References are stored on the document as strings and are
//! resolved only here, so no pipeline stage ever checks which backend is in
//! use:
//!
//! ```text
//! local      /var/lib/docreview/resumes/7/42/normalized.pdf
//!            local:///var/lib/docreview/resumes/7/42/normalized.pdf
//! remote     s3://bucket/prefix/resumes/7/42/normalized.pdf
//! ```
//!
//! When no bucket is configured the store runs in local-only mode and copies
//! artifacts under a durable root directory. When a bucket is configured but
//! cannot be reached (or is missing its region) every operation that needs it
//! fails with [`ReviewError::StorageUnavailable`].

use crate::config::StorageConfig;
use crate::error::ReviewError;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::{debug, info, warn};

const LOCAL_SCHEME: &str = "local://";

// ── References ───────────────────────────────────────────────────────────

/// An opaque artifact location that carries its own resolution scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRef {
    /// A file on the local file system.
    Local(PathBuf),
    /// An object in a remote store, `scheme://bucket/key`.
    Remote {
        scheme: String,
        bucket: String,
        key: String,
    },
}

impl StorageRef {
    /// Parse a stored reference. Anything without a `scheme://` prefix is a
    /// local path.
    pub fn parse(raw: &str) -> Result<Self, ReviewError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ReviewError::NotFound("empty storage reference".into()));
        }
        if let Some(path) = raw.strip_prefix(LOCAL_SCHEME) {
            return Ok(StorageRef::Local(PathBuf::from(path)));
        }
        if let Some((scheme, rest)) = raw.split_once("://") {
            let is_scheme = !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-');
            if is_scheme {
                return match rest.split_once('/') {
                    Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                        Ok(StorageRef::Remote {
                            scheme: scheme.to_lowercase(),
                            bucket: bucket.to_string(),
                            key: key.to_string(),
                        })
                    }
                    _ => Err(ReviewError::NotFound(format!(
                        "invalid storage reference '{raw}'"
                    ))),
                };
            }
        }
        Ok(StorageRef::Local(PathBuf::from(raw)))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageRef::Remote { .. })
    }

    /// Final path component, used as the download filename.
    pub fn file_name(&self) -> String {
        match self {
            StorageRef::Local(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            StorageRef::Remote { key, .. } => key.rsplit('/').next().unwrap_or(key).to_string(),
        }
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageRef::Local(p) => write!(f, "{}", p.display()),
            StorageRef::Remote {
                scheme,
                bucket,
                key,
            } => write!(f, "{scheme}://{bucket}/{key}"),
        }
    }
}

/// Logical key for a document artifact: `resumes/<user>/<document>/<filename>`.
pub fn document_key(user_id: u64, document_id: u64, filename: &str) -> String {
    format!("resumes/{user_id}/{document_id}/{filename}")
}

/// Guess a content type from a file extension.
pub fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "json" => "application/json",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

// ── Streams ──────────────────────────────────────────────────────────────

/// A readable, seekable artifact body.
pub trait BlobReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> BlobReader for T {}

/// An opened artifact, ready to stream back to a client.
pub struct BlobStream {
    pub reader: Box<dyn BlobReader>,
    pub size: u64,
    pub content_type: String,
}

impl fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStream")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish()
    }
}

// ── Store ────────────────────────────────────────────────────────────────

enum RemoteBackend {
    Disabled,
    Ready {
        store: Arc<dyn ObjectStore>,
        scheme: String,
        bucket: String,
        prefix: String,
    },
    Misconfigured(String),
}

/// Uniform put/get over the local file system and a remote object store.
pub struct BlobStore {
    local_root: PathBuf,
    remote: RemoteBackend,
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remote = match &self.remote {
            RemoteBackend::Disabled => "disabled".to_string(),
            RemoteBackend::Ready { scheme, bucket, .. } => format!("{scheme}://{bucket}"),
            RemoteBackend::Misconfigured(e) => format!("misconfigured ({e})"),
        };
        f.debug_struct("BlobStore")
            .field("local_root", &self.local_root)
            .field("remote", &remote)
            .finish()
    }
}

impl BlobStore {
    /// Local-only store rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: root.into(),
            remote: RemoteBackend::Disabled,
        }
    }

    /// Store backed by an existing object store, e.g. `InMemory` in tests or
    /// a pre-built client shared with other services.
    pub fn with_object_store(
        store: Arc<dyn ObjectStore>,
        scheme: &str,
        bucket: &str,
        prefix: &str,
        local_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_root: local_root.into(),
            remote: RemoteBackend::Ready {
                store,
                scheme: scheme.to_string(),
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            },
        }
    }

    /// Build from configuration. Never fails: a broken remote configuration
    /// is remembered and reported as `StorageUnavailable` on first use, so a
    /// host can still start and serve local artifacts.
    pub fn from_config(config: &StorageConfig) -> Self {
        let Some(bucket) = config.bucket.clone() else {
            info!("Blob store: local-only mode at {}", config.local_root.display());
            return Self::local(config.local_root.clone());
        };
        let Some(region) = config.region.clone() else {
            warn!("Blob store: AWS_S3_BUCKET is set but AWS_REGION is not");
            return Self {
                local_root: config.local_root.clone(),
                remote: RemoteBackend::Misconfigured("AWS_REGION is not set".into()),
            };
        };

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&bucket)
            .with_region(&region);
        if let Some(ref endpoint) = config.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }

        match builder.build() {
            Ok(s3) => {
                info!("Blob store: s3://{} (region {})", bucket, region);
                Self::with_object_store(
                    Arc::new(s3),
                    "s3",
                    &bucket,
                    &config.prefix,
                    config.local_root.clone(),
                )
            }
            Err(e) => {
                warn!("Blob store: failed to build S3 client: {}", e);
                Self {
                    local_root: config.local_root.clone(),
                    remote: RemoteBackend::Misconfigured(e.to_string()),
                }
            }
        }
    }

    /// Whether artifacts are pushed to a remote store.
    pub fn is_remote(&self) -> bool {
        !matches!(self.remote, RemoteBackend::Disabled)
    }

    /// Fail early if the remote backend is configured but unusable.
    pub fn ensure_available(&self) -> Result<(), ReviewError> {
        match &self.remote {
            RemoteBackend::Misconfigured(e) => Err(ReviewError::StorageUnavailable(e.clone())),
            _ => Ok(()),
        }
    }

    /// Publish a local file under `logical_key` and return its reference.
    pub async fn put(
        &self,
        local_path: &Path,
        logical_key: &str,
        content_type: &str,
    ) -> Result<StorageRef, ReviewError> {
        match &self.remote {
            RemoteBackend::Misconfigured(e) => Err(ReviewError::StorageUnavailable(e.clone())),
            RemoteBackend::Ready {
                store,
                scheme,
                bucket,
                prefix,
            } => {
                let data = read_local(local_path).await?;
                let key = join_key(prefix, logical_key);
                let mut attributes = Attributes::new();
                attributes.insert(Attribute::ContentType, content_type.to_string().into());
                let opts = PutOptions {
                    attributes,
                    ..Default::default()
                };
                store
                    .put_opts(&ObjectPath::from(key.as_str()), PutPayload::from(data), opts)
                    .await
                    .map_err(|e| ReviewError::StorageUnavailable(e.to_string()))?;
                debug!("Pushed {} → {}://{}/{}", local_path.display(), scheme, bucket, key);
                Ok(StorageRef::Remote {
                    scheme: scheme.clone(),
                    bucket: bucket.clone(),
                    key,
                })
            }
            RemoteBackend::Disabled => {
                let dest = self.local_root.join(logical_key);
                if !same_file(local_path, &dest) {
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::copy(local_path, &dest)
                        .await
                        .map_err(|e| map_local_err(local_path, e))?;
                }
                debug!("Published {} → {}", local_path.display(), dest.display());
                Ok(StorageRef::Local(dest))
            }
        }
    }

    /// Materialise `reference` at `dest`. A local reference that already is
    /// `dest` is a no-op.
    pub async fn get_local_copy(
        &self,
        reference: &StorageRef,
        dest: &Path,
    ) -> Result<(), ReviewError> {
        match reference {
            StorageRef::Local(src) => {
                if same_file(src, dest) {
                    return Ok(());
                }
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(src, dest)
                    .await
                    .map_err(|e| map_local_err(src, e))?;
                Ok(())
            }
            StorageRef::Remote { .. } => {
                let (store, path) = self.resolve_remote(reference)?;
                let result = store.get(&path).await.map_err(map_object_err)?;
                let data = result.bytes().await.map_err(map_object_err)?;
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(dest, &data).await?;
                debug!("Fetched {} → {} ({} bytes)", reference, dest.display(), data.len());
                Ok(())
            }
        }
    }

    /// Open `reference` for streaming. Remote bodies are buffered so the
    /// returned reader supports range seeks.
    pub async fn open_stream(&self, reference: &StorageRef) -> Result<BlobStream, ReviewError> {
        match reference {
            StorageRef::Local(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| map_local_err(path, e))?;
                let size = file.metadata().await?.len();
                Ok(BlobStream {
                    reader: Box::new(file),
                    size,
                    content_type: content_type_for_path(path).to_string(),
                })
            }
            StorageRef::Remote { key, .. } => {
                let (store, path) = self.resolve_remote(reference)?;
                let result = store.get(&path).await.map_err(map_object_err)?;
                let content_type = result
                    .attributes
                    .get(&Attribute::ContentType)
                    .map(|v| {
                        let s: &str = v.as_ref();
                        s.to_string()
                    })
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| content_type_for_path(Path::new(key)).to_string());
                let data = result.bytes().await.map_err(map_object_err)?.to_vec();
                Ok(BlobStream {
                    size: data.len() as u64,
                    reader: Box::new(Cursor::new(data)),
                    content_type,
                })
            }
        }
    }

    fn resolve_remote(
        &self,
        reference: &StorageRef,
    ) -> Result<(&Arc<dyn ObjectStore>, ObjectPath), ReviewError> {
        let StorageRef::Remote {
            scheme,
            bucket,
            key,
        } = reference
        else {
            return Err(ReviewError::Internal("expected a remote reference".into()));
        };
        match &self.remote {
            RemoteBackend::Disabled => Err(ReviewError::StorageUnavailable(format!(
                "'{reference}' needs a remote store but none is configured"
            ))),
            RemoteBackend::Misconfigured(e) => Err(ReviewError::StorageUnavailable(e.clone())),
            RemoteBackend::Ready {
                store,
                scheme: own_scheme,
                bucket: own_bucket,
                ..
            } => {
                if scheme != own_scheme || bucket != own_bucket {
                    return Err(ReviewError::NotFound(format!(
                        "'{reference}' is outside {own_scheme}://{own_bucket}"
                    )));
                }
                Ok((store, ObjectPath::from(key.as_str())))
            }
        }
    }
}

fn join_key(prefix: &str, logical_key: &str) -> String {
    let key = logical_key.trim_start_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, ReviewError> {
    tokio::fs::read(path).await.map_err(|e| map_local_err(path, e))
}

fn map_local_err(path: &Path, e: std::io::Error) -> ReviewError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ReviewError::NotFound(path.display().to_string())
    } else {
        ReviewError::Internal(format!("{}: {}", path.display(), e))
    }
}

fn map_object_err(e: object_store::Error) -> ReviewError {
    match e {
        object_store::Error::NotFound { path, .. } => ReviewError::NotFound(path),
        other => ReviewError::StorageUnavailable(other.to_string()),
    }
}
