//! Task service: the entry points callers use, plus the expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use visage_core::{new_task_id, DetectionTask};
use visage_detect::{DetectError, Detector};
use visage_queue::{QueueError, WorkQueue};
use visage_storage::{artifact_key, ArtifactStore, StorageError};
use visage_store::{StoreError, TaskStore};

use crate::pipeline::{remove_artifact, CleanupOutcome};

/// Extension used when an upload does not name one.
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Artifact deletions in flight during a sweep.
const SWEEP_DELETE_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("model warmup failed: {0}")]
    Warmup(#[from] DetectError),
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub tasks_removed: usize,
    pub artifacts_deleted: usize,
    pub artifacts_missing: usize,
    pub artifact_failures: usize,
}

pub struct TaskService {
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    artifacts: Arc<ArtifactStore>,
    detector: Arc<dyn Detector>,
}

impl TaskService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        artifacts: Arc<ArtifactStore>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        Self {
            tasks,
            queue,
            artifacts,
            detector,
        }
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// Store an uploaded image under a fresh id and create its task.
    pub async fn submit(
        &self,
        bytes: Bytes,
        extension: Option<&str>,
    ) -> Result<DetectionTask, ServiceError> {
        let id = new_task_id();
        let extension = extension
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or(DEFAULT_EXTENSION)
            .to_ascii_lowercase();
        let key = artifact_key(&id, &extension);

        self.artifacts.write(&key, bytes).await?;
        match self.create_task(&id, &key).await {
            Ok(task) => Ok(task),
            Err(e) => {
                remove_artifact(&self.artifacts, &key).await;
                Err(e)
            }
        }
    }

    /// Write a `pending` record and enqueue it. Does not wait for processing.
    pub async fn create_task(
        &self,
        id: &str,
        artifact_path: &str,
    ) -> Result<DetectionTask, ServiceError> {
        let task = DetectionTask::pending(id, artifact_path);
        self.tasks.save(&task).await?;

        if let Err(e) = self.queue.enqueue(id).await {
            error!(task_id = %id, error = %e, "failed to enqueue task");
            self.tasks.delete(id).await?;
            return Err(e.into());
        }

        info!(task_id = %id, artifact = %artifact_path, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<DetectionTask>, ServiceError> {
        Ok(self.tasks.find_by_id(id).await?)
    }

    /// Remove expired tasks, then their artifacts.
    pub async fn clean_old_tasks(&self, max_age: Duration) -> Result<SweepReport, ServiceError> {
        let removed = self.tasks.delete_expired(max_age).await?;
        let mut report = SweepReport {
            tasks_removed: removed.len(),
            ..SweepReport::default()
        };

        let keys: Vec<String> = removed.iter().map(|task| task.artifact_path.clone()).collect();
        let artifacts = &self.artifacts;
        let outcomes: Vec<CleanupOutcome> = stream::iter(keys)
            .map(|key| async move { remove_artifact(artifacts, &key).await })
            .buffer_unordered(SWEEP_DELETE_CONCURRENCY)
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                CleanupOutcome::Deleted => report.artifacts_deleted += 1,
                CleanupOutcome::Missing | CleanupOutcome::Kept => report.artifacts_missing += 1,
                CleanupOutcome::Failed(_) => report.artifact_failures += 1,
            }
        }

        if report.tasks_removed > 0 {
            info!(
                tasks = report.tasks_removed,
                artifacts = report.artifacts_deleted,
                failures = report.artifact_failures,
                "expired tasks cleaned up"
            );
        }
        Ok(report)
    }

    /// Load the model. Failure here must stop startup.
    pub async fn warmup(&self) -> Result<(), ServiceError> {
        info!(detector = self.detector.name(), "warming up model");
        self.detector.load().await?;
        info!(detector = self.detector.name(), "model ready");
        Ok(())
    }

    /// Run [`clean_old_tasks`](Self::clean_old_tasks) every `interval`,
    /// starting one interval from now.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, max_age: Duration) -> SweepHandle {
        let (tx, mut rx) = watch::channel(false);
        let service = Arc::clone(self);
        let interval = interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut tick = tokio::time::interval_at(start, interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval_secs = interval.as_secs(),
                max_age_secs = max_age.as_secs(),
                "expiry sweeper started"
            );
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = rx.changed() => break,
                }
                if *rx.borrow() {
                    break;
                }
                if let Err(e) = service.clean_old_tasks(max_age).await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }
            info!("expiry sweeper stopped");
        });

        SweepHandle { shutdown: tx, join }
    }
}

/// Owns the periodic sweep task.
pub struct SweepHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweepHandle {
    /// Signal the sweeper and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "expiry sweeper task ended abnormally");
        }
    }
}
