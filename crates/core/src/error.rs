use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("Unknown gender label: {0}")]
    UnknownGender(String),

    #[error("{0}")]
    Other(String),
}
