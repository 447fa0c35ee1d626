//! Capability-addressed file storage.
//!
//! Every stored object is a content blob named by its public key plus a JSON
//! sidecar (`<public_key>.meta.json`) holding the [`FileRecord`]. Content is
//! always made durable before its sidecar becomes visible, and deletion is
//! only reachable through the private key recorded in the sidecar.

pub mod cloud;
pub mod local;

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::config::{StorageConfig, StorageProviderKind};
use crate::error::{AppError, Result};

pub use cloud::{CloudStorage, CloudStorageSettings};
pub use local::LocalStorage;

pub const META_SUFFIX: &str = ".meta.json";

const MAX_TOKEN_LEN: usize = 128;
const LOCK_STRIPES: usize = 64;

pub type ContentStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub private_key: String,
    pub public_key: String,
    pub original_name: String,
    pub mime_type: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn new(file: &StagedFile, public_key: &str, private_key: &str, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            private_key: private_key.to_string(),
            public_key: public_key.to_string(),
            original_name: file.original_name.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes,
            uploaded_at: now,
            last_accessed_at: Some(now),
        }
    }

    /// Sidecars written before access tracking fall back to the upload time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.uploaded_at)
    }

    pub fn is_inactive(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_activity()) > threshold
    }

    pub fn matches_private_key(&self, candidate: &str) -> bool {
        self.private_key.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = Some(now);
    }
}

/// An upload already spooled to disk by the HTTP layer.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

pub struct FileDownload {
    pub stream: ContentStream,
    pub mime_type: String,
    pub original_name: String,
    pub size_bytes: u64,
}

impl std::fmt::Debug for FileDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDownload")
            .field("mime_type", &self.mime_type)
            .field("original_name", &self.original_name)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub orphans_removed: usize,
    pub failed: usize,
}

/// Backend capability set. No operation has a default body, so a new
/// backend that forgets an operation does not compile.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist `file` under `public_key`; the staged input is removed on success.
    async fn upload(
        &self,
        file: StagedFile,
        public_key: &str,
        private_key: &str,
    ) -> Result<(String, String)>;

    /// Resolve a public key to its content stream and refresh its access time.
    async fn download(&self, public_key: &str) -> Result<FileDownload>;

    /// Remove the record owning `private_key`. `Ok(false)` when nothing matches.
    async fn delete(&self, private_key: &str) -> Result<bool>;

    async fn exists(&self, public_key: &str) -> Result<bool>;

    /// Remove every record idle for longer than `threshold` as of `now`.
    async fn sweep(&self, threshold: Duration, now: DateTime<Utc>) -> Result<SweepReport>;
}

pub fn resolve_storage_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
    let timeout = std::time::Duration::from_secs(config.operation_timeout_seconds);

    let provider: Arc<dyn StorageProvider> = match config.provider {
        StorageProviderKind::Local => Arc::new(
            LocalStorage::new(&config.root_folder).with_operation_timeout(timeout),
        ),
        StorageProviderKind::Google => {
            let path = config.cloud_config_path.as_ref().ok_or_else(|| {
                AppError::Configuration("CONFIG path is not set for the google provider".to_string())
            })?;
            Arc::new(CloudStorage::from_config_file(path)?.with_operation_timeout(timeout))
        }
    };

    info!("Using storage provider: {}", config.provider);
    Ok(provider)
}

/// Tokens are used verbatim as object names, so anything outside
/// `[A-Za-z0-9]` is rejected before touching a backend.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

pub fn sidecar_name(public_key: &str) -> String {
    format!("{}{}", public_key, META_SUFFIX)
}

/// Striped async locks serializing writers to the same public key.
pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock().await
    }
}

pub(crate) async fn with_timeout<T, F>(limit: std::time::Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AppError::StorageWrite(format!("{} timed out after {:?}", what, limit)))?
}
