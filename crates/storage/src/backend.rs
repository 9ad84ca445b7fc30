use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tracing::info;

use visage_core::config::AwsConfig;

use crate::error::StorageError;

/// Unified storage backend wrapping object_store.
pub enum StorageBackend {
    Local(LocalBackend),
    S3(S3Backend),
    Memory(Arc<dyn ObjectStore>),
}

impl StorageBackend {
    pub fn store(&self) -> &dyn ObjectStore {
        match self {
            StorageBackend::Local(b) => b.store.as_ref(),
            StorageBackend::S3(b) => b.store.as_ref(),
            StorageBackend::Memory(store) => store.as_ref(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3(_))
    }

    /// Key prefix applied to every artifact (e.g. "production").
    pub fn prefix(&self) -> &str {
        match self {
            StorageBackend::S3(b) => &b.prefix,
            StorageBackend::Local(_) | StorageBackend::Memory(_) => "",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StorageBackend::Local(_) => "local",
            StorageBackend::S3(_) => "s3",
            StorageBackend::Memory(_) => "memory",
        }
    }
}

/// Local filesystem backend.
pub struct LocalBackend {
    pub store: Arc<dyn ObjectStore>,
    pub root: PathBuf,
}

impl LocalBackend {
    /// Root the backend at `root`, creating the directory when missing.
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root)?;
        let canonical = std::fs::canonicalize(root)?;
        let store = LocalFileSystem::new_with_prefix(&canonical)
            .map_err(|e| StorageError::Other(format!("local filesystem error: {e}")))?;
        info!("Artifacts: local backend at {}", canonical.display());
        Ok(Self {
            store: Arc::new(store),
            root: canonical,
        })
    }
}

/// S3 backend.
pub struct S3Backend {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    pub prefix: String,
}

impl S3Backend {
    pub fn new(aws: &AwsConfig, bucket: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        if bucket.is_empty() {
            return Err(StorageError::NotConfigured("artifact bucket is empty".into()));
        }

        let mut builder = AmazonS3Builder::new().with_region(&aws.region);

        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }

        match aws.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                // object_store requires absolute endpoint URLs
                let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.to_string()
                } else {
                    format!("https://{}", endpoint)
                };
                builder = builder
                    .with_bucket_name(bucket)
                    .with_endpoint(&endpoint_url)
                    .with_allow_http(endpoint_url.starts_with("http://"));
            }
            None => {
                builder = builder.with_url(format!("s3://{}", bucket));
            }
        }

        let store = builder.build()?;
        let prefix = prefix.unwrap_or("").trim_matches('/').to_string();

        info!(
            "Artifacts: S3 backend s3://{}/{} (region: {})",
            bucket, prefix, aws.region
        );

        Ok(Self {
            store: Arc::new(store),
            bucket: bucket.to_string(),
            prefix,
        })
    }
}

pub fn memory_backend() -> StorageBackend {
    StorageBackend::Memory(Arc::new(InMemory::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested").join("public");
        let backend = LocalBackend::new(&root).unwrap();
        assert!(root.is_dir());
        let backend = StorageBackend::Local(backend);
        assert!(!backend.is_remote());
        assert_eq!(backend.label(), "local");
    }

    #[test]
    fn s3_backend_rejects_empty_bucket() {
        let aws = AwsConfig {
            region: "us-east-1".into(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint_url: None,
        };
        assert!(matches!(
            S3Backend::new(&aws, "", None),
            Err(StorageError::NotConfigured(_))
        ));
    }

    #[test]
    fn s3_backend_normalizes_prefix() {
        let aws = AwsConfig {
            region: "us-east-1".into(),
            access_key_id: Some("AKIA".into()),
            secret_access_key: Some("secret".into()),
            session_token: None,
            endpoint_url: Some("localhost:9000".into()),
        };
        let backend = S3Backend::new(&aws, "artifacts", Some("/visage/")).unwrap();
        assert_eq!(backend.prefix, "visage");
        assert!(StorageBackend::S3(backend).is_remote());
    }
}
