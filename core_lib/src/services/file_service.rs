use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tracing::info;

use crate::{
    error::Result,
    storage::{FileDownload, StagedFile, StorageProvider},
};

pub const PUBLIC_KEY_BYTES: usize = 16;
pub const PRIVATE_KEY_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// Hex-encoded token drawn from the operating system CSPRNG.
fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn generate_keys() -> KeyPair {
    KeyPair {
        public_key: random_token(PUBLIC_KEY_BYTES),
        private_key: random_token(PRIVATE_KEY_BYTES),
    }
}

#[derive(Clone)]
pub struct FileService {
    storage: Arc<dyn StorageProvider>,
}

impl FileService {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    pub async fn upload_file(&self, file: StagedFile) -> Result<KeyPair> {
        let keys = generate_keys();
        let (public_key, private_key) = self
            .storage
            .upload(file, &keys.public_key, &keys.private_key)
            .await?;

        info!(public_key = %public_key, backend = self.storage.name(), "File uploaded");
        Ok(KeyPair { public_key, private_key })
    }

    pub async fn download_file(&self, public_key: &str) -> Result<FileDownload> {
        self.storage.download(public_key).await
    }

    pub async fn delete_file(&self, private_key: &str) -> Result<bool> {
        self.storage.delete(private_key).await
    }

    pub async fn file_exists(&self, public_key: &str) -> Result<bool> {
        self.storage.exists(public_key).await
    }
}
