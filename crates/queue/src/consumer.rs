//! Queue backend and job handler traits.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::{FailOutcome, Job, Lease, QueueCounts, StallReport};

/// Durable, at-least-once work queue of task identifiers.
///
/// A job is delivered to one worker at a time through a [`Lease`]. Leases
/// that are neither completed nor failed before the lock duration runs out
/// are recovered by [`WorkQueue::recover_stalled`] and delivered again.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Record a job for `task_id`. Independent of task record state.
    async fn enqueue(&self, task_id: &str) -> Result<Job, QueueError>;

    /// Claim the oldest due job, if any.
    async fn reserve(&self) -> Result<Option<Lease>, QueueError>;

    /// Acknowledge a successful delivery. `false` means the lease was lost
    /// and nothing changed.
    async fn complete(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Record a failed delivery and schedule a retry or give up.
    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError>;

    /// Recover every active job whose lease expired.
    async fn recover_stalled(&self) -> Result<StallReport, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Park until new work may be available or `timeout` elapses.
    ///
    /// Backends without change notification simply sleep.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Backend label for logs and health output.
    fn name(&self) -> &'static str;
}

/// Processes delivered jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one delivery. An `Err` counts as a failed attempt.
    async fn handle(&self, lease: &Lease) -> anyhow::Result<()>;

    /// Called once a job will never be delivered again without a
    /// successful attempt, either because its attempts ran out or because
    /// it stalled too often.
    async fn on_terminal_failure(&self, _job_id: &str, _task_id: &str, _error: &str) {}
}
