use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    is_valid_token, sidecar_name, with_timeout, FileDownload, FileRecord, KeyLocks, StagedFile,
    StorageProvider, SweepReport, META_SUFFIX,
};
use crate::error::{AppError, Result};

const TEMP_MARKER: &str = ".tmp-";

/// Filesystem backend: `<root>/<public_key>` plus `<root>/<public_key>.meta.json`.
#[derive(Clone)]
pub struct LocalStorage {
    root: PathBuf,
    locks: Arc<KeyLocks>,
    operation_timeout: std::time::Duration,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(KeyLocks::new()),
            operation_timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Read the stored record for `public_key` without touching it.
    pub async fn record(&self, public_key: &str) -> Result<FileRecord> {
        if !is_valid_token(public_key) {
            return Err(AppError::NotFound("file not found".to_string()));
        }
        read_record(&self.meta_path(public_key)).await
    }

    fn content_path(&self, public_key: &str) -> PathBuf {
        self.root.join(public_key)
    }

    fn meta_path(&self, public_key: &str) -> PathBuf {
        self.root.join(sidecar_name(public_key))
    }

    async fn persist_content(&self, staged: &Path, target: &Path) -> std::io::Result<u64> {
        let temp = temp_path_for(target);

        let result = async {
            let copied = async_fs::copy(staged, &temp).await?;
            async_fs::File::open(&temp).await?.sync_all().await?;
            async_fs::rename(&temp, target).await?;
            Ok(copied)
        }
        .await;

        if result.is_err() {
            let _ = async_fs::remove_file(&temp).await;
        }
        result
    }

    async fn remove_pair(&self, public_key: &str) -> Result<()> {
        remove_if_present(&self.content_path(public_key)).await.map_err(|e| {
            AppError::StorageWrite(format!("Failed to delete content {}: {}", public_key, e))
        })?;

        remove_if_present(&self.meta_path(public_key)).await.map_err(|e| {
            AppError::StorageWrite(format!("Failed to delete metadata for {}: {}", public_key, e))
        })?;

        Ok(())
    }

    async fn evict_if_inactive(
        &self,
        public_key: &str,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.locks.lock(public_key).await;

        let record = match read_record(&self.meta_path(public_key)).await {
            Ok(record) => record,
            Err(AppError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        if !record.is_inactive(threshold, now) {
            return Ok(false);
        }

        self.remove_pair(public_key).await?;

        let idle = now.signed_duration_since(record.last_activity());
        info!(
            public_key = %public_key,
            inactive_minutes = idle.num_minutes(),
            "Deleted inactive file and metadata"
        );
        Ok(true)
    }

    async fn remove_stale_leftover(
        &self,
        path: &Path,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let modified = match async_fs::metadata(path).await {
            Ok(meta) if meta.is_file() => DateTime::<Utc>::from(meta.modified()?),
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if now.signed_duration_since(modified) <= threshold {
            return Ok(false);
        }

        remove_if_present(path).await.map_err(|e| {
            AppError::StorageWrite(format!("Failed to delete {}: {}", path.display(), e))
        })?;
        warn!(path = %path.display(), "Removed orphaned file without metadata");
        Ok(true)
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        let mut entries = match async_fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn upload(
        &self,
        file: StagedFile,
        public_key: &str,
        private_key: &str,
    ) -> Result<(String, String)> {
        if !is_valid_token(public_key) || !is_valid_token(private_key) {
            return Err(AppError::BadRequest("Malformed capability token".to_string()));
        }

        async_fs::create_dir_all(&self.root).await.map_err(|e| {
            AppError::StorageWrite(format!("Failed to create {}: {}", self.root.display(), e))
        })?;

        let _guard = self.locks.lock(public_key).await;
        let content_path = self.content_path(public_key);

        let size = self
            .persist_content(&file.path, &content_path)
            .await
            .map_err(|e| {
                AppError::StorageWrite(format!("Failed to persist content for {}: {}", public_key, e))
            })?;

        let record = FileRecord::new(&file, public_key, private_key, size);
        if let Err(e) = write_record(&self.meta_path(public_key), &record).await {
            if let Err(cleanup) = remove_if_present(&content_path).await {
                error!(
                    public_key = %public_key,
                    "Failed to roll back content after metadata failure: {}", cleanup
                );
            }
            return Err(e);
        }

        if let Err(e) = async_fs::remove_file(&file.path).await {
            warn!(path = %file.path.display(), "Failed to remove staged upload: {}", e);
        }

        debug!(public_key = %public_key, size, "Stored file");
        Ok((public_key.to_string(), private_key.to_string()))
    }

    async fn download(&self, public_key: &str) -> Result<FileDownload> {
        if !is_valid_token(public_key) {
            return Err(AppError::NotFound("file not found".to_string()));
        }

        let _guard = self.locks.lock(public_key).await;
        let meta_path = self.meta_path(public_key);

        let mut record = read_record(&meta_path).await?;

        let content = async_fs::File::open(self.content_path(public_key))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => AppError::NotFound("file not found".to_string()),
                _ => AppError::IoError(e),
            })?;

        record.touch(Utc::now());
        write_record(&meta_path, &record).await?;

        Ok(FileDownload {
            stream: ReaderStream::new(content).boxed(),
            mime_type: record.mime_type,
            original_name: record.original_name,
            size_bytes: record.size_bytes,
        })
    }

    async fn delete(&self, private_key: &str) -> Result<bool> {
        if !is_valid_token(private_key) {
            return Ok(false);
        }

        for name in self.list_names().await? {
            if !name.ends_with(META_SUFFIX) {
                continue;
            }

            let record = match read_record(&self.root.join(&name)).await {
                Ok(record) => record,
                Err(AppError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(sidecar = %name, "Skipping unreadable metadata: {}", e);
                    continue;
                }
            };

            if !record.matches_private_key(private_key) {
                continue;
            }

            let _guard = self.locks.lock(&record.public_key).await;
            if !async_fs::try_exists(self.meta_path(&record.public_key)).await? {
                return Ok(false);
            }

            self.remove_pair(&record.public_key).await?;
            info!(public_key = %record.public_key, "Deleted file by private key");
            return Ok(true);
        }

        Ok(false)
    }

    async fn exists(&self, public_key: &str) -> Result<bool> {
        if !is_valid_token(public_key) {
            return Ok(false);
        }
        Ok(async_fs::try_exists(self.content_path(public_key)).await?)
    }

    async fn sweep(&self, threshold: Duration, now: DateTime<Utc>) -> Result<SweepReport> {
        info!("Starting cleanup of inactive files in {}", self.root.display());

        let names = self.list_names().await?;
        let present: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut report = SweepReport::default();

        for name in &names {
            let outcome = if name.contains(TEMP_MARKER) {
                let path = self.root.join(name);
                with_timeout(self.operation_timeout, name, self.remove_stale_leftover(&path, threshold, now))
                    .await
                    .map(|removed| (false, removed))
            } else if let Some(public_key) = name.strip_suffix(META_SUFFIX) {
                report.scanned += 1;
                with_timeout(self.operation_timeout, name, self.evict_if_inactive(public_key, threshold, now))
                    .await
                    .map(|deleted| (deleted, false))
            } else if !present.contains(sidecar_name(name).as_str()) {
                let path = self.root.join(name);
                with_timeout(self.operation_timeout, name, self.remove_stale_leftover(&path, threshold, now))
                    .await
                    .map(|removed| (false, removed))
            } else {
                continue;
            };

            match outcome {
                Ok((deleted, orphan)) => {
                    report.deleted += usize::from(deleted);
                    report.orphans_removed += usize::from(orphan);
                }
                Err(e) => {
                    report.failed += 1;
                    error!(entry = %name, "Error processing file during cleanup: {}", e);
                }
            }
        }

        info!(
            deleted = report.deleted,
            orphans = report.orphans_removed,
            failed = report.failed,
            "Cleanup completed. Deleted {} file(s) and their metadata",
            report.deleted
        );
        Ok(report)
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}{}{}", name, TEMP_MARKER, Uuid::new_v4().simple()))
}

async fn read_record(meta_path: &Path) -> Result<FileRecord> {
    let raw = async_fs::read(meta_path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => AppError::NotFound("file not found".to_string()),
        _ => AppError::IoError(e),
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Write-to-temp then rename, so readers never observe a half-written sidecar.
async fn write_record(meta_path: &Path, record: &FileRecord) -> Result<()> {
    let data = serde_json::to_vec(record)?;
    let temp = temp_path_for(meta_path);

    let result = async {
        let mut file = async_fs::File::create(&temp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        async_fs::rename(&temp, meta_path).await
    }
    .await;

    if let Err(e) = result {
        let _ = async_fs::remove_file(&temp).await;
        return Err(AppError::StorageWrite(format!(
            "Failed to write metadata {}: {}",
            meta_path.display(),
            e
        )));
    }

    Ok(())
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match async_fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use tempfile::TempDir;

    async fn stage(dir: &TempDir, name: &str, data: &[u8]) -> StagedFile {
        let path = dir.path().join(format!("staged-{}", Uuid::new_v4()));
        async_fs::write(&path, data).await.unwrap();
        StagedFile {
            path,
            original_name: name.to_string(),
            mime_type: "text/plain".to_string(),
            size_bytes: data.len() as u64,
        }
    }

    fn setup() -> (LocalStorage, TempDir, TempDir) {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        (LocalStorage::new(root.path()), root, staging)
    }

    async fn read_all(download: FileDownload) -> Vec<u8> {
        let chunks: Vec<bytes::Bytes> = download.stream.try_collect().await.unwrap();
        chunks.concat()
    }

    const PUBLIC: &str = "0123456789abcdef0123456789abcdef";
    const PRIVATE: &str = "fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

    #[tokio::test]
    async fn test_upload_and_download_round_trip() {
        let (storage, root, staging) = setup();
        let staged = stage(&staging, "hello.txt", b"Hello, World!").await;
        let staged_path = staged.path.clone();

        let keys = storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();
        assert_eq!(keys, (PUBLIC.to_string(), PRIVATE.to_string()));

        assert!(!staged_path.exists(), "staged input should be removed");
        assert!(root.path().join(PUBLIC).exists());
        assert!(root.path().join(format!("{}.meta.json", PUBLIC)).exists());

        let download = storage.download(PUBLIC).await.unwrap();
        assert_eq!(download.original_name, "hello.txt");
        assert_eq!(download.mime_type, "text/plain");
        assert_eq!(download.size_bytes, 13);
        assert_eq!(read_all(download).await, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_sidecar_contents() {
        let (storage, root, staging) = setup();
        let staged = stage(&staging, "notes.txt", b"abc").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();

        let raw = std::fs::read_to_string(root.path().join(format!("{}.meta.json", PUBLIC))).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["public_key"], PUBLIC);
        assert_eq!(json["private_key"], PRIVATE);
        assert_eq!(json["original_name"], "notes.txt");
        assert_eq!(json["mime_type"], "text/plain");
        assert_eq!(json["size"], 3);
        assert!(json["uploaded_at"].is_string());
    }

    #[tokio::test]
    async fn test_download_updates_last_accessed() {
        let (storage, _root, staging) = setup();
        let staged = stage(&staging, "a.txt", b"a").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();

        let before = storage.record(PUBLIC).await.unwrap().last_activity();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let _ = storage.download(PUBLIC).await.unwrap();
        let after = storage.record(PUBLIC).await.unwrap().last_activity();

        assert!(after > before);
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (storage, _root, _staging) = setup();
        let err = storage.download("nonexistentkey").await.unwrap_err();
        assert!(err.is_not_found());

        let err = storage.download("../../etc/passwd").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_download_with_missing_content_is_not_found() {
        let (storage, root, staging) = setup();
        let staged = stage(&staging, "a.txt", b"a").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();

        std::fs::remove_file(root.path().join(PUBLIC)).unwrap();
        assert!(storage.download(PUBLIC).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_requires_private_key() {
        let (storage, root, staging) = setup();
        let staged = stage(&staging, "a.txt", b"secret").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();

        assert!(!storage.delete(PUBLIC).await.unwrap());
        assert!(storage.exists(PUBLIC).await.unwrap());

        assert!(storage.delete(PRIVATE).await.unwrap());
        assert!(!root.path().join(PUBLIC).exists());
        assert!(!root.path().join(format!("{}.meta.json", PUBLIC)).exists());

        assert!(!storage.delete(PRIVATE).await.unwrap());
        assert!(storage.download(PUBLIC).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_skips_corrupt_sidecars() {
        let (storage, root, staging) = setup();
        std::fs::create_dir_all(root.path()).unwrap();
        std::fs::write(root.path().join("broken.meta.json"), b"{not json").unwrap();

        let staged = stage(&staging, "a.txt", b"a").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();

        assert!(storage.delete(PRIVATE).await.unwrap());
    }

    #[tokio::test]
    async fn test_exists() {
        let (storage, _root, staging) = setup();
        assert!(!storage.exists(PUBLIC).await.unwrap());

        let staged = stage(&staging, "a.txt", b"a").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();
        assert!(storage.exists(PUBLIC).await.unwrap());
        assert!(!storage.exists("../x").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_no_pair() {
        let (storage, root, _staging) = setup();
        let missing = StagedFile {
            path: PathBuf::from("/definitely/not/here"),
            original_name: "x".to_string(),
            mime_type: "text/plain".to_string(),
            size_bytes: 1,
        };

        let err = storage.upload(missing, PUBLIC, PRIVATE).await.unwrap_err();
        assert!(matches!(err, AppError::StorageWrite(_)));
        assert!(!root.path().join(PUBLIC).exists());
        assert!(!root.path().join(format!("{}.meta.json", PUBLIC)).exists());
    }

    #[tokio::test]
    async fn test_metadata_failure_rolls_back_content() {
        let (storage, root, staging) = setup();
        let sidecar = root.path().join(format!("{}.meta.json", PUBLIC));
        async_fs::create_dir(&sidecar).await.unwrap();

        let staged = stage(&staging, "hello.txt", b"Hello, World!").await;
        let staged_path = staged.path.clone();

        let err = storage.upload(staged, PUBLIC, PRIVATE).await.unwrap_err();
        assert!(matches!(err, AppError::StorageWrite(_)));
        assert!(!root.path().join(PUBLIC).exists());
        assert!(staged_path.exists());

        let mut entries = async_fs::read_dir(root.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![format!("{}.meta.json", PUBLIC)]);
    }

    #[tokio::test]
    async fn test_sweep_threshold_boundaries() {
        let (storage, _root, staging) = setup();
        let staged = stage(&staging, "a.txt", b"a").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();

        let accessed = storage.record(PUBLIC).await.unwrap().last_activity();
        let threshold = Duration::minutes(2);

        let report = storage
            .sweep(threshold, accessed + threshold - Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.scanned, 1);
        assert!(storage.exists(PUBLIC).await.unwrap());

        let report = storage
            .sweep(threshold, accessed + threshold + Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!storage.exists(PUBLIC).await.unwrap());
        assert!(storage.record(PUBLIC).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sweep_continues_past_bad_records() {
        let (storage, root, staging) = setup();
        let staged = stage(&staging, "a.txt", b"a").await;
        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();
        std::fs::write(root.path().join("corrupt.meta.json"), b"garbage").unwrap();

        let now = Utc::now() + Duration::hours(1);
        let report = storage.sweep(Duration::minutes(2), now).await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_orphans() {
        let (storage, root, _staging) = setup();
        std::fs::create_dir_all(root.path()).unwrap();
        std::fs::write(root.path().join("orphancontent"), b"left behind").unwrap();
        std::fs::write(root.path().join("abc.meta.json.tmp-123"), b"partial").unwrap();

        let report = storage.sweep(Duration::minutes(2), Utc::now()).await.unwrap();
        assert_eq!(report.orphans_removed, 0);

        let later = Utc::now() + Duration::minutes(10);
        let report = storage.sweep(Duration::minutes(2), later).await.unwrap();
        assert_eq!(report.orphans_removed, 2);
        assert!(!root.path().join("orphancontent").exists());
    }

    #[tokio::test]
    async fn test_sweep_on_missing_root_is_empty() {
        let storage = LocalStorage::new("/nonexistent/fileshare/root");
        let report = storage.sweep(Duration::minutes(1), Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
