use std::sync::Arc;

use async_trait::async_trait;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use sha2::{Digest, Sha256};

use super::MediaKind;
use crate::config::{BlobNaming, BlobStoreConfig};
use crate::error::CryptoError;

/// Opaque ciphertext storage. Never sees plaintext or keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CryptoError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, CryptoError>;
}

/// [`BlobStore`] over any `object_store` backend.
#[derive(Clone)]
pub struct ObjectBlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl ObjectBlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// - `"local"` backend: creates the directory if needed, uses `LocalFileSystem`
    /// - `"memory"` backend: uses `InMemory`
    pub fn from_config(config: &BlobStoreConfig) -> Result<Self, CryptoError> {
        match config.backend.as_str() {
            "local" => {
                std::fs::create_dir_all(&config.local_path)?;
                let store = LocalFileSystem::new_with_prefix(&config.local_path)?;
                Ok(Self::new(Arc::new(store)))
            }
            "memory" => Ok(Self::in_memory()),
            other => Err(CryptoError::ConfigError(format!(
                "unknown blob store backend: {other}"
            ))),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CryptoError> {
        let len = bytes.len();
        self.inner
            .put(&StorePath::from(key), PutPayload::from(bytes))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, key, "blob put failed");
                CryptoError::from(e)
            })?;
        tracing::debug!(key, len, "stored blob");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CryptoError> {
        let result = self.inner.get(&StorePath::from(key)).await?;
        let bytes = result.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Choose the blob key for a ciphertext.
pub fn blob_key(kind: MediaKind, naming: BlobNaming, ciphertext: &[u8]) -> String {
    match naming {
        BlobNaming::ContentAddressed => {
            let digest = Sha256::digest(ciphertext);
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            format!("{}/{hex}", kind.as_str())
        }
        BlobNaming::Random => format!("{}/{}", kind.as_str(), uuid::Uuid::new_v4()),
    }
}
