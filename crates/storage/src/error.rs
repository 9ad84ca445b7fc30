use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}
