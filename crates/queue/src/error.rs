//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt job {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("queue closed")]
    Closed,
}
