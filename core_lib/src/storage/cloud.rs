use std::collections::HashSet;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::{StreamExt, TryStreamExt};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutPayload, WriteMultipart};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use super::{
    is_valid_token, sidecar_name, with_timeout, FileDownload, FileRecord, KeyLocks, StagedFile,
    StorageProvider, SweepReport, META_SUFFIX,
};
use crate::error::{AppError, Result};

const UPLOAD_READ_CHUNK: usize = 64 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 4;

/// Contents of the JSON file pointed to by the `CONFIG` setting.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudStorageSettings {
    pub bucket_name: String,
    pub gcp_key_file_path: PathBuf,
}

/// Object-store backend. Each record is an object named by the public key
/// and a companion `<public_key>.meta.json` object.
#[derive(Clone)]
pub struct CloudStorage {
    store: Arc<dyn ObjectStore>,
    locks: Arc<KeyLocks>,
    operation_timeout: std::time::Duration,
}

impl CloudStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            locks: Arc::new(KeyLocks::new()),
            operation_timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn from_config_file(path: &FsPath) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!("Cannot read cloud config {}: {}", path.display(), e))
        })?;
        let settings: CloudStorageSettings = serde_json::from_str(&raw).map_err(|e| {
            AppError::Configuration(format!("Invalid cloud config {}: {}", path.display(), e))
        })?;
        Self::google(&settings)
    }

    pub fn google(settings: &CloudStorageSettings) -> Result<Self> {
        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(&settings.bucket_name)
            .with_service_account_path(settings.gcp_key_file_path.to_string_lossy())
            .build()
            .map_err(|e| AppError::Configuration(format!("Google Cloud Storage setup failed: {}", e)))?;

        info!(bucket = %settings.bucket_name, "Configured Google Cloud Storage bucket");
        Ok(Self::new(Arc::new(store)))
    }

    async fn read_record(&self, public_key: &str) -> Result<FileRecord> {
        let location = Path::from(sidecar_name(public_key));
        let raw = self.store.get(&location).await?.bytes().await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_record(&self, record: &FileRecord) -> Result<()> {
        let location = Path::from(sidecar_name(&record.public_key));
        let payload = PutPayload::from(serde_json::to_vec(record)?);
        self.store.put(&location, payload).await?;
        Ok(())
    }

    /// Streams the staged file into a multipart upload. The upload is
    /// aborted if the staged file cannot be read to the end.
    async fn stream_content(&self, staged: &FsPath, location: &Path) -> Result<u64> {
        let file = tokio::fs::File::open(staged).await?;
        let mut chunks = ReaderStream::with_capacity(file, UPLOAD_READ_CHUNK);
        let mut writer = WriteMultipart::new(self.store.put_multipart(location).await?);
        let mut size: u64 = 0;

        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort) = writer.abort().await {
                        warn!(object = %location, "Failed to abort multipart upload: {}", abort);
                    }
                    return Err(e.into());
                }
            };

            if let Err(e) = writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await {
                if let Err(abort) = writer.abort().await {
                    warn!(object = %location, "Failed to abort multipart upload: {}", abort);
                }
                return Err(e.into());
            }

            size += chunk.len() as u64;
            writer.write(&chunk);
        }

        writer.finish().await?;
        Ok(size)
    }

    async fn delete_if_present(&self, location: &Path) -> Result<()> {
        match self.store.delete(location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(AppError::StorageWrite(format!("Failed to delete {}: {}", location, e))),
        }
    }

    async fn remove_pair(&self, public_key: &str) -> Result<()> {
        self.delete_if_present(&Path::from(public_key)).await?;
        self.delete_if_present(&Path::from(sidecar_name(public_key))).await
    }

    async fn list_objects(&self) -> Result<Vec<ObjectMeta>> {
        Ok(self.store.list(None).try_collect().await?)
    }

    async fn evict_if_inactive(
        &self,
        public_key: &str,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.locks.lock(public_key).await;

        let record = match self.read_record(public_key).await {
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
            "Deleted inactive object and metadata"
        );
        Ok(true)
    }
}

fn object_name(meta: &ObjectMeta) -> Option<&str> {
    meta.location.filename()
}

#[async_trait]
impl StorageProvider for CloudStorage {
    fn name(&self) -> &'static str {
        "google"
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

        let _guard = self.locks.lock(public_key).await;
        let content_location = Path::from(public_key);

        let size = self
            .stream_content(&file.path, &content_location)
            .await
            .map_err(|e| {
                AppError::StorageWrite(format!("Failed to upload content for {}: {}", public_key, e))
            })?;

        let record = FileRecord::new(&file, public_key, private_key, size);
        if let Err(e) = self.write_record(&record).await {
            if let Err(cleanup) = self.delete_if_present(&content_location).await {
                error!(
                    public_key = %public_key,
                    "Failed to roll back content after metadata failure: {}", cleanup
                );
            }
            return Err(AppError::StorageWrite(format!(
                "Failed to upload metadata for {}: {}",
                public_key, e
            )));
        }

        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            warn!(path = %file.path.display(), "Failed to remove staged upload: {}", e);
        }

        debug!(public_key = %public_key, size, "Stored object");
        Ok((public_key.to_string(), private_key.to_string()))
    }

    async fn download(&self, public_key: &str) -> Result<FileDownload> {
        if !is_valid_token(public_key) {
            return Err(AppError::NotFound("file not found".to_string()));
        }

        let _guard = self.locks.lock(public_key).await;

        let mut record = self.read_record(public_key).await?;
        let content = self.store.get(&Path::from(public_key)).await?;

        record.touch(Utc::now());
        self.write_record(&record).await?;

        let stream = content
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed();

        Ok(FileDownload {
            stream,
            mime_type: record.mime_type,
            original_name: record.original_name,
            size_bytes: record.size_bytes,
        })
    }

    async fn delete(&self, private_key: &str) -> Result<bool> {
        if !is_valid_token(private_key) {
            return Ok(false);
        }

        for meta in self.list_objects().await? {
            let Some(public_key) = object_name(&meta).and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };

            let record = match self.read_record(public_key).await {
                Ok(record) => record,
                Err(AppError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(object = %meta.location, "Skipping unreadable metadata: {}", e);
                    continue;
                }
            };

            if !record.matches_private_key(private_key) {
                continue;
            }

            let _guard = self.locks.lock(&record.public_key).await;
            match self.store.head(&Path::from(sidecar_name(&record.public_key))).await {
                Ok(_) => {}
                Err(object_store::Error::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e.into()),
            }

            self.remove_pair(&record.public_key).await?;
            info!(public_key = %record.public_key, "Deleted object by private key");
            return Ok(true);
        }

        Ok(false)
    }

    async fn exists(&self, public_key: &str) -> Result<bool> {
        if !is_valid_token(public_key) {
            return Ok(false);
        }

        match self.store.head(&Path::from(public_key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep(&self, threshold: Duration, now: DateTime<Utc>) -> Result<SweepReport> {
        info!("Starting cleanup of inactive objects");

        let objects = self.list_objects().await?;
        let present: HashSet<String> = objects
            .iter()
            .filter_map(object_name)
            .map(str::to_string)
            .collect();
        let mut report = SweepReport::default();

        for meta in &objects {
            let Some(name) = object_name(meta) else {
                continue;
            };

            let outcome = if let Some(public_key) = name.strip_suffix(META_SUFFIX) {
                report.scanned += 1;
                with_timeout(self.operation_timeout, name, self.evict_if_inactive(public_key, threshold, now))
                    .await
                    .map(|deleted| (deleted, false))
            } else if !present.contains(&sidecar_name(name))
                && now.signed_duration_since(meta.last_modified) > threshold
            {
                with_timeout(self.operation_timeout, name, self.delete_if_present(&meta.location))
                    .await
                    .map(|()| {
                        warn!(object = %meta.location, "Removed orphaned object without metadata");
                        (false, true)
                    })
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
                    error!(object = %name, "Error deleting object during cleanup: {}", e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, PutMultipartOpts, PutOptions,
        PutResult,
    };
    use tempfile::TempDir;

    /// Delegates to an in-memory store but refuses every sidecar write.
    #[derive(Debug)]
    struct SidecarRejectingStore {
        inner: Arc<InMemory>,
    }

    impl std::fmt::Display for SidecarRejectingStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "SidecarRejectingStore")
        }
    }

    #[async_trait]
    impl ObjectStore for SidecarRejectingStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            if location.as_ref().ends_with(META_SUFFIX) {
                return Err(object_store::Error::Generic {
                    store: "SidecarRejectingStore",
                    source: "metadata writes are refused".into(),
                });
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> futures_util::stream::BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    const PUBLIC: &str = "00112233445566778899aabbccddeeff";
    const PRIVATE: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

    fn setup() -> (CloudStorage, Arc<InMemory>, TempDir) {
        let memory = Arc::new(InMemory::new());
        let storage = CloudStorage::new(memory.clone());
        (storage, memory, TempDir::new().unwrap())
    }

    async fn stage(dir: &TempDir, data: &[u8]) -> StagedFile {
        let path = dir.path().join(format!("staged-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, data).await.unwrap();
        StagedFile {
            path,
            original_name: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: data.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let (storage, memory, staging) = setup();
        let staged = stage(&staging, b"%PDF-1.7 body").await;
        let staged_path = staged.path.clone();

        storage.upload(staged, PUBLIC, PRIVATE).await.unwrap();
        assert!(!staged_path.exists());
        assert!(memory.head(&Path::from(format!("{}.meta.json", PUBLIC))).await.is_ok());

        let download = storage.download(PUBLIC).await.unwrap();
        assert_eq!(download.original_name, "report.pdf");
        assert_eq!(download.mime_type, "application/pdf");

        let chunks: Vec<bytes::Bytes> = download.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"%PDF-1.7 body");
    }

    #[tokio::test]
    async fn test_download_records_access_time() {
        let (storage, _memory, staging) = setup();
        storage.upload(stage(&staging, b"x").await, PUBLIC, PRIVATE).await.unwrap();

        let before = storage.read_record(PUBLIC).await.unwrap().last_activity();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        storage.download(PUBLIC).await.unwrap();
        let after = storage.read_record(PUBLIC).await.unwrap().last_activity();

        assert!(after > before);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (storage, _memory, _staging) = setup();
        assert!(storage.download(PUBLIC).await.unwrap_err().is_not_found());
        assert!(!storage.exists(PUBLIC).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_by_private_key_only() {
        let (storage, memory, staging) = setup();
        storage.upload(stage(&staging, b"x").await, PUBLIC, PRIVATE).await.unwrap();

        assert!(!storage.delete(PUBLIC).await.unwrap());
        assert!(storage.exists(PUBLIC).await.unwrap());

        assert!(storage.delete(PRIVATE).await.unwrap());
        assert!(!storage.exists(PUBLIC).await.unwrap());
        assert!(memory.head(&Path::from(format!("{}.meta.json", PUBLIC))).await.is_err());

        assert!(!storage.delete(PRIVATE).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_failure_rolls_back_content() {
        let memory = Arc::new(InMemory::new());
        let storage = CloudStorage::new(Arc::new(SidecarRejectingStore {
            inner: memory.clone(),
        }));
        let staging = TempDir::new().unwrap();

        let staged = stage(&staging, b"%PDF-1.7 body").await;
        let staged_path = staged.path.clone();

        let err = storage.upload(staged, PUBLIC, PRIVATE).await.unwrap_err();
        assert!(matches!(err, AppError::StorageWrite(_)));
        assert!(memory.head(&Path::from(PUBLIC)).await.is_err());
        assert!(staged_path.exists());

        let remaining: Vec<ObjectMeta> = memory.list(None).try_collect().await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_upload_streams_multi_chunk_content() {
        let (storage, _memory, staging) = setup();
        let content: Vec<u8> = (0..UPLOAD_READ_CHUNK * 3 + 17).map(|i| (i % 251) as u8).collect();

        storage.upload(stage(&staging, &content).await, PUBLIC, PRIVATE).await.unwrap();

        let download = storage.download(PUBLIC).await.unwrap();
        assert_eq!(download.size_bytes, content.len() as u64);
        let chunks: Vec<bytes::Bytes> = download.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), content);
    }

    #[tokio::test]
    async fn test_delete_after_concurrent_eviction_reports_false() {
        let (storage, memory, staging) = setup();
        storage.upload(stage(&staging, b"x").await, PUBLIC, PRIVATE).await.unwrap();

        let guard = storage.locks.lock(PUBLIC).await;
        let deleting = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.delete(PRIVATE).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        memory.delete(&Path::from(PUBLIC)).await.unwrap();
        memory.delete(&Path::from(format!("{}.meta.json", PUBLIC))).await.unwrap();
        drop(guard);

        assert!(!deleting.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_sweep_threshold_boundaries() {
        let (storage, _memory, staging) = setup();
        storage.upload(stage(&staging, b"x").await, PUBLIC, PRIVATE).await.unwrap();

        let accessed = storage.read_record(PUBLIC).await.unwrap().last_activity();
        let threshold = Duration::minutes(2);

        let report = storage
            .sweep(threshold, accessed + threshold - Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(report.deleted, 0);
        assert!(storage.exists(PUBLIC).await.unwrap());

        let report = storage
            .sweep(threshold, accessed + threshold + Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!storage.exists(PUBLIC).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_orphan_objects() {
        let (storage, memory, _staging) = setup();
        memory
            .put(&Path::from("orphan"), PutPayload::from(b"left".to_vec()))
            .await
            .unwrap();
        memory
            .put(&Path::from("broken.meta.json"), PutPayload::from(b"nope".to_vec()))
            .await
            .unwrap();

        let report = storage
            .sweep(Duration::minutes(2), Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.failed, 1);
        assert!(!storage.exists("orphan").await.unwrap());
    }

    #[test]
    fn test_missing_config_file_is_configuration_error() {
        let result = CloudStorage::from_config_file(FsPath::new("/no/such/gcp.json"));
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_settings_parse() {
        let settings: CloudStorageSettings = serde_json::from_str(
            r#"{"bucket_name": "shared-files", "gcp_key_file_path": "/secrets/key.json"}"#,
        )
        .unwrap();
        assert_eq!(settings.bucket_name, "shared-files");
        assert_eq!(settings.gcp_key_file_path, PathBuf::from("/secrets/key.json"));
    }
}
