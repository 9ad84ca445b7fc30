//! One processing attempt for one task.
//!
//! ```text
//! find task ─▶ processing ─▶ read artifact ─▶ decode ─▶ detect ─▶ map ─▶ completed
//!                                  │                                        │
//!                                  └──────────── any error ─▶ failed ◀──────┘
//! ```
//!
//! The artifact is removed once the attempt resolves. On a failed attempt
//! that still has retries left it stays in place so the next attempt can
//! read it; the expiry sweep catches anything left behind.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use visage_core::{DetectionResult, DetectionTask, TaskStatus};
use visage_detect::{decode_image, map_faces, DetectError, Detector};
use visage_queue::{JobHandler, Lease};
use visage_storage::{ArtifactStore, StorageError};
use visage_store::{StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Task not found")]
    TaskNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error("image decoding aborted: {0}")]
    DecodeAborted(String),
}

/// What happened to an artifact when it was cleaned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    /// Nothing was stored under the key.
    Missing,
    /// Deliberately left for a later attempt.
    Kept,
    Failed(String),
}

/// Delete an artifact, logging instead of propagating failures.
pub async fn remove_artifact(artifacts: &ArtifactStore, key: &str) -> CleanupOutcome {
    match artifacts.delete(key).await {
        Ok(true) => {
            debug!(key = %key, "artifact deleted");
            CleanupOutcome::Deleted
        }
        Ok(false) => CleanupOutcome::Missing,
        Err(e) => {
            warn!(key = %key, error = %e, "failed to delete artifact");
            CleanupOutcome::Failed(e.to_string())
        }
    }
}

pub struct DetectionPipeline {
    tasks: Arc<dyn TaskStore>,
    artifacts: Arc<ArtifactStore>,
    detector: Arc<dyn Detector>,
}

impl DetectionPipeline {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        artifacts: Arc<ArtifactStore>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        Self {
            tasks,
            artifacts,
            detector,
        }
    }

    /// Run one attempt and record its outcome on the task.
    ///
    /// `final_attempt` controls whether the artifact is removed after a
    /// failure.
    pub async fn run(
        &self,
        task_id: &str,
        final_attempt: bool,
    ) -> Result<DetectionResult, PipelineError> {
        let task = self
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| PipelineError::TaskNotFound(task_id.to_string()))?;

        let outcome = match self.attempt(&task).await {
            Ok(result) => self
                .tasks
                .update_status(&task.id, TaskStatus::Completed, Some(result.clone()), None)
                .await
                .map(|_| result)
                .map_err(PipelineError::from),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(result) => {
                info!(task_id = %task.id, persons = result.count, "task completed");
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, final_attempt, "task attempt failed");
                self.record_failure(&task.id, &e.to_string()).await;
            }
        }

        let cleanup = if outcome.is_ok() || final_attempt {
            remove_artifact(&self.artifacts, &task.artifact_path).await
        } else {
            CleanupOutcome::Kept
        };
        debug!(task_id = %task.id, cleanup = ?cleanup, "artifact cleanup");

        outcome
    }

    async fn attempt(&self, task: &DetectionTask) -> Result<DetectionResult, PipelineError> {
        self.tasks
            .update_status(&task.id, TaskStatus::Processing, None, None)
            .await?
            .ok_or_else(|| PipelineError::TaskNotFound(task.id.clone()))?;

        let bytes = self.artifacts.read(&task.artifact_path).await?;
        let input = tokio::task::spawn_blocking(move || decode_image(&bytes))
            .await
            .map_err(|e| PipelineError::DecodeAborted(e.to_string()))??;

        let faces = self.detector.detect(&input).await?;
        Ok(map_faces(&faces))
    }

    async fn record_failure(&self, task_id: &str, message: &str) {
        if let Err(e) = self
            .tasks
            .update_status(task_id, TaskStatus::Failed, None, Some(message.to_string()))
            .await
        {
            error!(task_id = %task_id, error = %e, "failed to record task failure");
        }
    }
}

#[async_trait]
impl JobHandler for DetectionPipeline {
    async fn handle(&self, lease: &Lease) -> anyhow::Result<()> {
        self.run(&lease.task_id, lease.is_final_attempt()).await?;
        Ok(())
    }

    /// Jobs that stall out never reach a final `run`, so the task is still
    /// `processing` and its artifact still stored.
    async fn on_terminal_failure(&self, job_id: &str, task_id: &str, error: &str) {
        let task = match self.tasks.find_by_id(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, task_id = %task_id, error = %e, "failed to load task after terminal failure");
                return;
            }
        };

        if !task.status.is_terminal() {
            self.record_failure(task_id, error).await;
        }
        let cleanup = remove_artifact(&self.artifacts, &task.artifact_path).await;
        debug!(job_id = %job_id, task_id = %task_id, cleanup = ?cleanup, "terminal failure handled");
    }
}
