use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded into a task record.
    #[error("corrupt task record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}
