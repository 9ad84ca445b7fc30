//! Durable task records.
//!
//! [`TaskStore`] is the single source of truth for task state. Two backends
//! ship with the crate: [`MemoryTaskStore`] for tests and single-process
//! deployments, and [`SqliteTaskStore`] for durable storage.

pub mod error;
pub mod memory;
pub mod sqlite;


use std::time::Duration;

use async_trait::async_trait;
use visage_core::{duration_millis, now_millis, DetectionResult, DetectionTask, TaskStatus};

pub use error::StoreError;
pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

/// Persistence contract for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite the record keyed by `task.id`.
    async fn save(&self, task: &DetectionTask) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<DetectionTask>, StoreError>;

    /// Apply a status transition and bump `updated_at`.
    ///
    /// Returns `None` without writing anything when the record no longer
    /// exists. `result` is kept only for `Completed` and `error` only for
    /// `Failed`.
    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<DetectionResult>,
        error: Option<String>,
    ) -> Result<Option<DetectionTask>, StoreError>;

    /// Remove a single record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Remove and return every record with `updated_at <= cutoff_ms`.
    async fn delete_updated_before(&self, cutoff_ms: i64) -> Result<Vec<DetectionTask>, StoreError>;

    /// Remove and return every record whose last update is at least
    /// `max_age` old.
    async fn delete_expired(&self, max_age: Duration) -> Result<Vec<DetectionTask>, StoreError> {
        let cutoff = now_millis().saturating_sub(duration_millis(max_age));
        self.delete_updated_before(cutoff).await
    }

    /// Backend label for logs and health output.
    fn name(&self) -> &'static str;
}
