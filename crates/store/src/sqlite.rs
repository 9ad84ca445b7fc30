use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};
use visage_core::{now_millis, DetectionResult, DetectionTask, TaskStatus};

use crate::{StoreError, TaskStore};

const TASK_COLUMNS: &str = "id, status, image_path, result, error, created_at, updated_at";

/// Open a SQLite pool for `url`, creating the database file when missing.
///
/// In-memory databases are limited to one connection since every
/// connection would otherwise see its own empty database.
pub async fn connect_pool(url: &str) -> Result<SqlitePool, StoreError> {
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 8 })
        .connect_with(options)
        .await?;
    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    status: String,
    image_path: String,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TaskRow> for DetectionTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status).map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            reason: e.to_string(),
        })?;
        let result = match row.result.as_deref() {
            Some(json) => Some(serde_json::from_str::<DetectionResult>(json).map_err(|e| {
                StoreError::Corrupt {
                    id: row.id.clone(),
                    reason: format!("result column: {e}"),
                }
            })?),
            None => None,
        };
        Ok(DetectionTask {
            id: row.id,
            status,
            artifact_path: row.image_path,
            result,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Decode a deleted row, keeping the identity and artifact path of rows that
/// no longer decode.
fn salvage_row(row: TaskRow) -> DetectionTask {
    let fallback = DetectionTask {
        id: row.id.clone(),
        status: TaskStatus::Failed,
        artifact_path: row.image_path.clone(),
        result: None,
        error: None,
        created_at: row.created_at,
        updated_at: row.updated_at,
    };
    match DetectionTask::try_from(row) {
        Ok(task) => task,
        Err(e) => {
            warn!(task_id = %fallback.id, error = %e, "expired row did not decode");
            DetectionTask {
                error: Some(e.to_string()),
                ..fallback
            }
        }
    }
}

/// Task records in a SQLite table.
///
/// Status updates and expiry deletes are single statements, so each is
/// atomic without an explicit transaction.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let store = Self::new(connect_pool(url).await?);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the table and index if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS detection_tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                image_path TEXT NOT NULL,
                result TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_detection_tasks_updated_at \
             ON detection_tasks (updated_at)",
        )
        .execute(&self.pool)
        .await?;
        info!("detection_tasks schema ready");
        Ok(())
    }
}

fn encode_result(result: Option<&DetectionResult>) -> Result<Option<String>, StoreError> {
    Ok(match result {
        Some(r) => Some(serde_json::to_string(r)?),
        None => None,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save(&self, task: &DetectionTask) -> Result<(), StoreError> {
        let result = encode_result(task.result.as_ref())?;
        sqlx::query(
            "INSERT INTO detection_tasks (id, status, image_path, result, error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                status = excluded.status, \
                image_path = excluded.image_path, \
                result = excluded.result, \
                error = excluded.error, \
                created_at = excluded.created_at, \
                updated_at = excluded.updated_at",
        )
        .bind(&task.id)
        .bind(task.status.as_str())
        .bind(&task.artifact_path)
        .bind(result)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<DetectionTask>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM detection_tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DetectionTask::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<DetectionResult>,
        error: Option<String>,
    ) -> Result<Option<DetectionTask>, StoreError> {
        let result = match status {
            TaskStatus::Completed => encode_result(result.as_ref())?,
            _ => None,
        };
        let error = match status {
            TaskStatus::Failed => error,
            _ => None,
        };
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE detection_tasks \
             SET status = ?, result = ?, error = ?, updated_at = MAX(?, updated_at + 1) \
             WHERE id = ? \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .bind(now_millis())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DetectionTask::try_from).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let done = sqlx::query("DELETE FROM detection_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete_updated_before(&self, cutoff_ms: i64) -> Result<Vec<DetectionTask>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "DELETE FROM detection_tasks WHERE updated_at <= ? RETURNING {TASK_COLUMNS}"
        ))
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;
        // Rows are already gone; a corrupt one must still yield its artifact path.
        Ok(rows.into_iter().map(salvage_row).collect())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
