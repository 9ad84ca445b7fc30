//! Artifact storage for uploaded images.
//!
//! [`ArtifactStore`] exposes the three operations the pipeline needs
//! (write, read, delete) over any `object_store` backend.

pub mod backend;
pub mod error;

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::PutPayload;
use tracing::debug;

use visage_core::config::{AwsConfig, StorageConfig};

pub use backend::{memory_backend, LocalBackend, S3Backend, StorageBackend};
pub use error::StorageError;

/// Directory (key prefix) that holds uploaded images.
pub const UPLOADS_DIR: &str = "uploads";

/// Storage key for a task's uploaded image.
pub fn artifact_key(task_id: &str, extension: &str) -> String {
    format!("{}/{}.{}", UPLOADS_DIR, task_id, extension)
}

pub struct ArtifactStore {
    backend: StorageBackend,
}

impl ArtifactStore {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    /// Select S3 when a bucket is configured, else the local artifact dir.
    pub fn from_config(storage: &StorageConfig, aws: &AwsConfig) -> Result<Self, StorageError> {
        let backend = match storage.artifact_bucket.as_deref() {
            Some(bucket) => StorageBackend::S3(S3Backend::new(
                aws,
                bucket,
                storage.artifact_prefix.as_deref(),
            )?),
            None => StorageBackend::Local(LocalBackend::new(&storage.artifact_dir)?),
        };
        Ok(Self::new(backend))
    }

    pub fn in_memory() -> Self {
        Self::new(memory_backend())
    }

    fn location(&self, key: &str) -> Result<ObjectPath, StorageError> {
        let prefix = self.backend.prefix();
        let full = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", prefix, key)
        };
        ObjectPath::parse(&full).map_err(|e| StorageError::InvalidKey {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let location = self.location(key)?;
        let size = bytes.len();
        self.backend
            .store()
            .put(&location, PutPayload::from(bytes))
            .await?;
        debug!(key, size, backend = self.backend.label(), "artifact written");
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Bytes, StorageError> {
        let location = self.location(key)?;
        match self.backend.store().get(&location).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an artifact. Returns `false` when it was already gone.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let location = self.location(key)?;
        match self.backend.store().delete(&location).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let location = self.location(key)?;
        match self.backend.store().head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
