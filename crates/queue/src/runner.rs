//! Bounded-concurrency consumer loop.
//!
//! ```text
//! reserve ──▶ [semaphore slot] ──▶ JobHandler::handle ──▶ complete | fail
//!                                                             │
//! stall sweeper (every stalled_interval) ──▶ recover_stalled ─┴─▶ on_terminal_failure
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::consumer::{JobHandler, WorkQueue};
use crate::error::QueueError;
use crate::job::{FailOutcome, Lease};

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Maximum jobs in flight at once.
    pub concurrency: usize,
    /// Idle wait between polls of an empty queue.
    pub poll_interval: Duration,
    /// How often expired leases are looked for.
    pub stalled_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(500),
            stalled_interval: Duration::from_secs(30),
        }
    }
}

/// Lock-free counters updated by consumer tasks.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub in_flight: AtomicUsize,
    pub completed: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pub stalled: AtomicU64,
    pub lost_leases: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConsumerSnapshot {
    pub in_flight: usize,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub stalled: u64,
    pub lost_leases: u64,
}

impl ConsumerMetrics {
    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            lost_leases: self.lost_leases.load(Ordering::Relaxed),
        }
    }
}

/// Drives a [`WorkQueue`] with at most `concurrency` jobs in flight.
pub struct Consumer {
    queue: Arc<dyn WorkQueue>,
    options: ConsumerOptions,
    metrics: Arc<ConsumerMetrics>,
}

impl Consumer {
    pub fn new(queue: Arc<dyn WorkQueue>, options: ConsumerOptions) -> Self {
        Self {
            queue,
            options,
            metrics: Arc::new(ConsumerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Consume until `shutdown` flips to `true` (or its sender is dropped),
    /// then wait for in-flight jobs to finish.
    pub async fn run(
        &self,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let concurrency = self.options.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));

        info!(
            queue = self.queue.name(),
            concurrency,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "consumer started"
        );

        let sweeper = tokio::spawn(stall_sweeper(
            self.queue.clone(),
            handler.clone(),
            self.metrics.clone(),
            self.options.stalled_interval,
            shutdown.clone(),
        ));

        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => permit.map_err(|_| QueueError::Closed)?,
                _ = shutdown.changed() => break,
            };

            match self.queue.reserve().await {
                Ok(Some(lease)) => {
                    consecutive_errors = 0;
                    self.spawn_job(lease, handler.clone(), permit);
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    drop(permit);
                    tokio::select! {
                        _ = self.queue.wait_for_work(self.options.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    consecutive_errors += 1;
                    warn!(
                        error = %e,
                        consecutive_errors,
                        "queue reserve failed"
                    );
                    // Exponential backoff on errors (capped at 30s).
                    let backoff = Duration::from_millis(
                        (self.options.poll_interval.as_millis() as u64)
                            * 2u64.pow(consecutive_errors.min(5)),
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.min(Duration::from_secs(30))) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!(
            in_flight = self.metrics.in_flight.load(Ordering::Relaxed),
            "consumer stopping, draining in-flight jobs"
        );
        let _drained = slots
            .acquire_many(concurrency as u32)
            .await
            .map_err(|_| QueueError::Closed)?;
        sweeper.abort();
        info!("consumer stopped");
        Ok(())
    }

    fn spawn_job(&self, lease: Lease, handler: Arc<dyn JobHandler>, permit: OwnedSemaphorePermit) {
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        metrics.in_flight.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            debug!(job_id = %lease.job_id, task_id = %lease.task_id, attempt = lease.attempt, "job started");
            let outcome = handler.handle(&lease).await;
            settle(queue.as_ref(), handler.as_ref(), &metrics, &lease, outcome).await;
            metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }
}

/// Report a handler outcome back to the queue.
async fn settle(
    queue: &dyn WorkQueue,
    handler: &dyn JobHandler,
    metrics: &ConsumerMetrics,
    lease: &Lease,
    outcome: anyhow::Result<()>,
) {
    match outcome {
        Ok(()) => match queue.complete(lease).await {
            Ok(true) => {
                metrics.completed.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %lease.job_id, task_id = %lease.task_id, "job completed");
            }
            Ok(false) => {
                metrics.lost_leases.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %lease.job_id, task_id = %lease.task_id, "lease lost before completion ack");
            }
            Err(e) => {
                error!(job_id = %lease.job_id, error = %e, "failed to ack completed job");
            }
        },
        Err(err) => {
            let message = err.to_string();
            match queue.fail(lease, &message).await {
                Ok(FailOutcome::Retrying { next_attempt, delay }) => {
                    metrics.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        job_id = %lease.job_id,
                        task_id = %lease.task_id,
                        attempt = lease.attempt,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "job failed, retry scheduled"
                    );
                }
                Ok(FailOutcome::Exhausted { attempts }) => {
                    metrics.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        job_id = %lease.job_id,
                        task_id = %lease.task_id,
                        attempts,
                        error = %message,
                        "job failed permanently"
                    );
                    handler
                        .on_terminal_failure(&lease.job_id, &lease.task_id, &message)
                        .await;
                }
                Ok(FailOutcome::LeaseLost) => {
                    metrics.lost_leases.fetch_add(1, Ordering::Relaxed);
                    warn!(job_id = %lease.job_id, task_id = %lease.task_id, "lease lost before failure ack");
                }
                Err(e) => {
                    error!(job_id = %lease.job_id, error = %e, "failed to record job failure");
                }
            }
        }
    }
}

async fn stall_sweeper(
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<ConsumerMetrics>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }

        let report = match queue.recover_stalled().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "stalled job check failed");
                continue;
            }
        };
        if report.is_empty() {
            continue;
        }

        metrics
            .stalled
            .fetch_add((report.requeued.len() + report.failed.len()) as u64, Ordering::Relaxed);
        for job_id in &report.requeued {
            warn!(job_id = %job_id, "stalled job moved back to waiting");
        }
        for job in &report.failed {
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            let message = job.last_error.as_deref().unwrap_or("job stalled");
            error!(job_id = %job.id, task_id = %job.task_id, "stalled job failed permanently");
            handler.on_terminal_failure(&job.id, &job.task_id, message).await;
        }
    }
}
