//! Durable queue backend on SQLite.
//!
//! Every state change is a single conditional statement so two workers (or
//! a worker and the stall sweeper) can never both win the same job.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, info, warn};

use visage_core::{duration_millis, millis_to_datetime, now_millis};

use crate::consumer::WorkQueue;
use crate::error::QueueError;
use crate::job::{
    FailOutcome, Job, JobState, Lease, QueueCounts, QueueOptions, StallReport, STALLED_ERROR,
};

const JOB_COLUMNS: &str =
    "id, task_id, state, attempts_made, stalled_count, due_at, enqueued_at, finished_at, last_error";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    task_id: String,
    state: String,
    attempts_made: i64,
    stalled_count: i64,
    due_at: i64,
    enqueued_at: i64,
    finished_at: Option<i64>,
    last_error: Option<String>,
}

impl JobRow {
    fn into_job(self, now_ms: i64) -> Result<Job, QueueError> {
        let state = match self.state.as_str() {
            "waiting" => JobState::Waiting,
            "delayed" if self.due_at <= now_ms => JobState::Waiting,
            "delayed" => JobState::Delayed,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            other => {
                return Err(QueueError::Corrupt {
                    id: self.id,
                    reason: format!("unknown state '{other}'"),
                })
            }
        };
        Ok(Job {
            id: self.id,
            task_id: self.task_id,
            state,
            attempts_made: self.attempts_made as u32,
            stalled_count: self.stalled_count as u32,
            enqueued_at: millis_to_datetime(self.enqueued_at),
            finished_at: self.finished_at.map(millis_to_datetime),
            last_error: self.last_error,
        })
    }
}

pub struct SqliteQueue {
    pool: SqlitePool,
    /// Several logical queues can share one table.
    queue: String,
    options: QueueOptions,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, queue: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            pool,
            queue: queue.into(),
            options,
        }
    }

    /// Create the jobs table if needed and return a ready queue.
    pub async fn open(
        pool: SqlitePool,
        queue: impl Into<String>,
        options: QueueOptions,
    ) -> Result<Self, QueueError> {
        let queue = Self::new(pool, queue, options);
        queue.migrate().await?;
        Ok(queue)
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                task_id TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                stalled_count INTEGER NOT NULL DEFAULT 0,
                due_at INTEGER NOT NULL,
                lease_token TEXT,
                lease_expires_at INTEGER,
                enqueued_at INTEGER NOT NULL,
                finished_at INTEGER,
                last_error TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_jobs_due ON queue_jobs (queue, state, due_at)",
        )
        .execute(&self.pool)
        .await?;
        info!(queue = %self.queue, "queue_jobs schema ready");
        Ok(())
    }

    /// Drop finished jobs beyond the retention limit for `state`.
    /// Retention runs after the ack has committed, so a failure here is
    /// logged and must not turn a successful ack into an error.
    async fn trim(&self, state: JobState, keep: usize) {
        if let Err(e) = self.try_trim(state, keep).await {
            warn!(queue = %self.queue, state = %state, error = %e, "failed to trim finished jobs");
        }
    }

    async fn try_trim(&self, state: JobState, keep: usize) -> Result<(), QueueError> {
        let done = sqlx::query(
            "DELETE FROM queue_jobs WHERE queue = ? AND state = ? AND seq NOT IN ( \
                SELECT seq FROM queue_jobs WHERE queue = ? AND state = ? \
                ORDER BY finished_at DESC, seq DESC LIMIT ? \
             )",
        )
        .bind(&self.queue)
        .bind(state.as_str())
        .bind(&self.queue)
        .bind(state.as_str())
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() > 0 {
            debug!(queue = %self.queue, state = %state, removed = done.rows_affected(), "trimmed finished jobs");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue(&self, task_id: &str) -> Result<Job, QueueError> {
        let job = Job::new(task_id);
        let now = job.enqueued_at.timestamp_millis();
        sqlx::query(
            "INSERT INTO queue_jobs (id, queue, task_id, state, due_at, enqueued_at) \
             VALUES (?, ?, ?, 'waiting', ?, ?)",
        )
        .bind(&job.id)
        .bind(&self.queue)
        .bind(&job.task_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!(job_id = %job.id, task_id, "job enqueued");
        Ok(job)
    }

    async fn reserve(&self) -> Result<Option<Lease>, QueueError> {
        let now = now_millis();
        let token = uuid::Uuid::new_v4().to_string();
        let expires = now.saturating_add(duration_millis(self.options.lock_duration));
        let row = sqlx::query(
            "UPDATE queue_jobs SET state = 'active', lease_token = ?, lease_expires_at = ? \
             WHERE seq = ( \
                SELECT seq FROM queue_jobs \
                WHERE queue = ? AND state IN ('waiting', 'delayed') AND due_at <= ? \
                ORDER BY due_at, seq LIMIT 1 \
             ) \
             RETURNING id, task_id, attempts_made",
        )
        .bind(&token)
        .bind(expires)
        .bind(&self.queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let attempts_made: i64 = row.try_get("attempts_made")?;
        Ok(Some(Lease {
            job_id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            token,
            attempt: attempts_made as u32 + 1,
            max_attempts: self.options.retry.max_attempts,
        }))
    }

    async fn complete(&self, lease: &Lease) -> Result<bool, QueueError> {
        let done = sqlx::query(
            "UPDATE queue_jobs SET state = 'completed', attempts_made = attempts_made + 1, \
                finished_at = ?, last_error = NULL, lease_token = NULL, lease_expires_at = NULL \
             WHERE id = ? AND state = 'active' AND lease_token = ?",
        )
        .bind(now_millis())
        .bind(&lease.job_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Ok(false);
        }
        self.trim(JobState::Completed, self.options.keep_completed).await;
        Ok(true)
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT attempts_made FROM queue_jobs WHERE id = ? AND state = 'active' AND lease_token = ?",
        )
        .bind(&lease.job_id)
        .bind(&lease.token)
        .fetch_optional(&self.pool)
        .await?;
        let Some(current) = current else {
            return Ok(FailOutcome::LeaseLost);
        };

        let attempts = current as u32 + 1;
        let now = now_millis();
        let (outcome, state, due_at, finished_at) = match self.options.retry.next_delay(attempts) {
            Some(delay) => (
                FailOutcome::Retrying {
                    next_attempt: attempts + 1,
                    delay,
                },
                JobState::Delayed,
                now.saturating_add(duration_millis(delay)),
                None,
            ),
            None => (
                FailOutcome::Exhausted { attempts },
                JobState::Failed,
                now,
                Some(now),
            ),
        };

        // Guarded on the attempt count too, so a concurrent recovery wins.
        let done = sqlx::query(
            "UPDATE queue_jobs SET state = ?, attempts_made = ?, due_at = ?, finished_at = ?, \
                last_error = ?, lease_token = NULL, lease_expires_at = NULL \
             WHERE id = ? AND state = 'active' AND lease_token = ? AND attempts_made = ?",
        )
        .bind(state.as_str())
        .bind(attempts as i64)
        .bind(due_at)
        .bind(finished_at)
        .bind(error)
        .bind(&lease.job_id)
        .bind(&lease.token)
        .bind(current)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Ok(FailOutcome::LeaseLost);
        }
        if state == JobState::Failed {
            self.trim(JobState::Failed, self.options.keep_failed).await;
        }
        Ok(outcome)
    }

    async fn recover_stalled(&self) -> Result<StallReport, QueueError> {
        let now = now_millis();
        let expired = sqlx::query(
            "SELECT id, lease_token, stalled_count FROM queue_jobs \
             WHERE queue = ? AND state = 'active' AND lease_expires_at <= ?",
        )
        .bind(&self.queue)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut report = StallReport::default();
        for row in expired {
            let id: String = row.try_get("id")?;
            let token: Option<String> = row.try_get("lease_token")?;
            let stalled_count: i64 = row.try_get("stalled_count")?;

            if stalled_count as u32 + 1 > self.options.max_stalled_count {
                let failed = sqlx::query_as::<_, JobRow>(&format!(
                    "UPDATE queue_jobs SET state = 'failed', stalled_count = stalled_count + 1, \
                        finished_at = ?, last_error = ?, lease_token = NULL, lease_expires_at = NULL \
                     WHERE id = ? AND state = 'active' AND lease_token IS ? \
                     RETURNING {JOB_COLUMNS}"
                ))
                .bind(now)
                .bind(STALLED_ERROR)
                .bind(&id)
                .bind(&token)
                .fetch_optional(&self.pool)
                .await?;
                if let Some(row) = failed {
                    report.failed.push(row.into_job(now)?);
                }
            } else {
                let done = sqlx::query(
                    "UPDATE queue_jobs SET state = 'waiting', stalled_count = stalled_count + 1, \
                        due_at = ?, lease_token = NULL, lease_expires_at = NULL \
                     WHERE id = ? AND state = 'active' AND lease_token IS ?",
                )
                .bind(now)
                .bind(&id)
                .bind(&token)
                .execute(&self.pool)
                .await?;
                if done.rows_affected() > 0 {
                    report.requeued.push(id);
                }
            }
        }

        if !report.failed.is_empty() {
            self.trim(JobState::Failed, self.options.keep_failed).await;
        }
        Ok(report)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = now_millis();
        let row = sqlx::query(
            "SELECT \
                COALESCE(SUM(CASE WHEN state = 'waiting' OR (state = 'delayed' AND due_at <= ?) THEN 1 ELSE 0 END), 0) AS waiting, \
                COALESCE(SUM(CASE WHEN state = 'delayed' AND due_at > ? THEN 1 ELSE 0 END), 0) AS delayed, \
                COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0) AS active, \
                COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0) AS completed, \
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0) AS failed \
             FROM queue_jobs WHERE queue = ?",
        )
        .bind(now)
        .bind(now)
        .bind(&self.queue)
        .fetch_one(&self.pool)
        .await?;

        let get = |name: &str| -> Result<u64, QueueError> { Ok(row.try_get::<i64, _>(name)? as u64) };
        Ok(QueueCounts {
            waiting: get("waiting")?,
            delayed: get("delayed")?,
            active: get("active")?,
            completed: get("completed")?,
            failed: get("failed")?,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ? AND queue = ?"
        ))
        .bind(job_id)
        .bind(&self.queue)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_job(now_millis())).transpose()
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::retry::{Backoff, RetryPolicy};

    async fn queue(options: QueueOptions) -> SqliteQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteQueue::open(pool, "detection", options).await.unwrap()
    }

    fn fast_options() -> QueueOptions {
        QueueOptions {
            retry: RetryPolicy {
                max_attempts: 2,
                backoff: Backoff::Exponential { delay: Duration::from_millis(30) },
            },
            lock_duration: Duration::from_millis(40),
            max_stalled_count: 1,
            keep_completed: 1,
            keep_failed: 1,
        }
    }

    #[tokio::test]
    async fn test_reserve_complete_cycle() {
        let q = queue(fast_options()).await;
        let job = q.enqueue("task-a").await.unwrap();
        q.enqueue("task-b").await.unwrap();

        let lease = q.reserve().await.unwrap().unwrap();
        assert_eq!(lease.job_id, job.id);
        assert_eq!(lease.attempt, 1);

        let counts = q.counts().await.unwrap();
        assert_eq!((counts.waiting, counts.active), (1, 1));

        assert!(q.complete(&lease).await.unwrap());
        assert!(!q.complete(&lease).await.unwrap());

        let stored = q.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_retry_then_exhaust() {
        let q = queue(fast_options()).await;
        let job = q.enqueue("task-a").await.unwrap();

        let first = q.reserve().await.unwrap().unwrap();
        let outcome = q.fail(&first, "model offline").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying { next_attempt: 2, delay: Duration::from_millis(30) }
        );
        assert!(q.reserve().await.unwrap().is_none());
        assert_eq!(q.counts().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = q.reserve().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert!(second.is_final_attempt());

        let outcome = q.fail(&second, "still offline").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 2 });

        let stored = q.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("still offline"));
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_ack() {
        let q = queue(fast_options()).await;
        q.enqueue("task-a").await.unwrap();
        let stale = q.reserve().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = q.recover_stalled().await.unwrap();
        assert_eq!(report.requeued, vec![stale.job_id.clone()]);

        let fresh = q.reserve().await.unwrap().unwrap();
        assert_eq!(fresh.job_id, stale.job_id);
        assert_eq!(q.fail(&stale, "late").await.unwrap(), FailOutcome::LeaseLost);
        assert!(!q.complete(&stale).await.unwrap());
        assert!(q.complete(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_repeated_stall_fails_job() {
        let q = queue(fast_options()).await;
        q.enqueue("task-a").await.unwrap();

        q.reserve().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(q.recover_stalled().await.unwrap().requeued.len(), 1);

        q.reserve().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = q.recover_stalled().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].task_id, "task-a");
        assert_eq!(report.failed[0].state, JobState::Failed);
        assert_eq!(report.failed[0].last_error.as_deref(), Some(STALLED_ERROR));
    }

    #[tokio::test]
    async fn test_retention_trims_oldest() {
        let q = queue(fast_options()).await;
        let first = q.enqueue("a").await.unwrap();
        let second = q.enqueue("b").await.unwrap();
        for _ in 0..2 {
            let lease = q.reserve().await.unwrap().unwrap();
            q.complete(&lease).await.unwrap();
        }
        assert_eq!(q.counts().await.unwrap().completed, 1);
        assert!(q.get_job(&first.id).await.unwrap().is_none());
        assert!(q.get_job(&second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_trim_failure_does_not_fail_the_ack() {
        let q = queue(QueueOptions {
            keep_completed: 0,
            keep_failed: 0,
            ..fast_options()
        })
        .await;
        sqlx::query(
            "CREATE TRIGGER block_trim BEFORE DELETE ON queue_jobs \
             BEGIN SELECT RAISE(ABORT, 'trim blocked'); END",
        )
        .execute(&q.pool)
        .await
        .unwrap();

        let done = q.enqueue("task-a").await.unwrap();
        let lease = q.reserve().await.unwrap().unwrap();
        assert!(q.complete(&lease).await.unwrap());
        assert_eq!(q.get_job(&done.id).await.unwrap().unwrap().state, JobState::Completed);

        let failing = q.enqueue("task-b").await.unwrap();
        let first = q.reserve().await.unwrap().unwrap();
        assert!(matches!(q.fail(&first, "x").await.unwrap(), FailOutcome::Retrying { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = q.reserve().await.unwrap().unwrap();
        assert_eq!(
            q.fail(&second, "y").await.unwrap(),
            FailOutcome::Exhausted { attempts: 2 }
        );
        assert_eq!(q.get_job(&failing.id).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let a = SqliteQueue::open(pool.clone(), "a", fast_options()).await.unwrap();
        let b = SqliteQueue::open(pool, "b", fast_options()).await.unwrap();
        a.enqueue("only-a").await.unwrap();
        assert!(b.reserve().await.unwrap().is_none());
        assert_eq!(a.reserve().await.unwrap().unwrap().task_id, "only-a");
    }
}
