//! In-process queue backend.
//!
//! Due times and lease expiry use `tokio::time::Instant`, so tests can drive
//! backoff and stall detection with a paused clock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::consumer::WorkQueue;
use crate::error::QueueError;
use crate::job::{
    FailOutcome, Job, JobState, Lease, QueueCounts, QueueOptions, StallReport, STALLED_ERROR,
};

struct Entry {
    job: Job,
    /// Earliest delivery time while waiting or delayed.
    due: Instant,
    seq: u64,
    lease: Option<ActiveLease>,
}

struct ActiveLease {
    token: String,
    expires: Instant,
}

impl Entry {
    fn effective_state(&self, now: Instant) -> JobState {
        match self.job.state {
            JobState::Delayed if self.due <= now => JobState::Waiting,
            state => state,
        }
    }

    fn snapshot(&self, now: Instant) -> Job {
        let mut job = self.job.clone();
        job.state = self.effective_state(now);
        job
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.job.state == JobState::Active
            && self.lease.as_ref().is_some_and(|l| l.token == lease.token)
    }
}

#[derive(Default)]
struct Inner {
    /// Insertion ordered so retention trimming drops the oldest first.
    jobs: IndexMap<String, Entry>,
    next_seq: u64,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl Inner {
    fn retain_finished(&mut self, state: JobState, id: String, keep: usize) {
        let list = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        list.push_back(id);
        let mut evicted = Vec::new();
        while list.len() > keep {
            if let Some(old) = list.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.jobs.shift_remove(&old);
        }
    }
}

pub struct MemoryQueue {
    options: QueueOptions,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn fail_entry(inner: &mut Inner, id: &str, error: &str, keep: usize) -> Option<Job> {
        let entry = inner.jobs.get_mut(id)?;
        entry.job.state = JobState::Failed;
        entry.job.finished_at = Some(Utc::now());
        entry.job.last_error = Some(error.to_string());
        entry.lease = None;
        let job = entry.job.clone();
        inner.retain_finished(JobState::Failed, id.to_string(), keep);
        Some(job)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, task_id: &str) -> Result<Job, QueueError> {
        let job = Job::new(task_id);
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.jobs.insert(
                job.id.clone(),
                Entry {
                    job: job.clone(),
                    due: Instant::now(),
                    seq,
                    lease: None,
                },
            );
        }
        self.notify.notify_one();
        debug!(job_id = %job.id, task_id, "job enqueued");
        Ok(job)
    }

    async fn reserve(&self) -> Result<Option<Lease>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let next = inner
            .jobs
            .values()
            .filter(|e| matches!(e.job.state, JobState::Waiting | JobState::Delayed) && e.due <= now)
            .min_by_key(|e| (e.due, e.seq))
            .map(|e| e.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let lease = Lease::issue(&entry.job, self.options.retry.max_attempts);
        entry.job.state = JobState::Active;
        entry.lease = Some(ActiveLease {
            token: lease.token.clone(),
            expires: now + self.options.lock_duration,
        });
        Ok(Some(lease))
    }

    async fn complete(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let Some(entry) = inner.jobs.get_mut(&lease.job_id) else {
            return Ok(false);
        };
        if !entry.holds(lease) {
            return Ok(false);
        }
        entry.job.state = JobState::Completed;
        entry.job.attempts_made += 1;
        entry.job.finished_at = Some(Utc::now());
        entry.job.last_error = None;
        entry.lease = None;
        let keep = self.options.keep_completed;
        inner.retain_finished(JobState::Completed, lease.job_id.clone(), keep);
        Ok(true)
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let Some(entry) = inner.jobs.get_mut(&lease.job_id) else {
            return Ok(FailOutcome::LeaseLost);
        };
        if !entry.holds(lease) {
            return Ok(FailOutcome::LeaseLost);
        }
        entry.job.attempts_made += 1;
        let attempts = entry.job.attempts_made;

        match self.options.retry.next_delay(attempts) {
            Some(delay) => {
                entry.job.state = JobState::Delayed;
                entry.job.last_error = Some(error.to_string());
                entry.due = now + delay;
                entry.lease = None;
                Ok(FailOutcome::Retrying {
                    next_attempt: attempts + 1,
                    delay,
                })
            }
            None => {
                let keep = self.options.keep_failed;
                Self::fail_entry(&mut inner, &lease.job_id, error, keep);
                Ok(FailOutcome::Exhausted { attempts })
            }
        }
    }

    async fn recover_stalled(&self) -> Result<StallReport, QueueError> {
        let now = Instant::now();
        let mut report = StallReport::default();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let expired: Vec<String> = inner
            .jobs
            .values()
            .filter(|e| {
                e.job.state == JobState::Active
                    && e.lease.as_ref().is_some_and(|l| l.expires <= now)
            })
            .map(|e| e.job.id.clone())
            .collect();

        for id in expired {
            let Some(entry) = inner.jobs.get_mut(&id) else {
                continue;
            };
            entry.job.stalled_count += 1;
            if entry.job.stalled_count > self.options.max_stalled_count {
                let keep = self.options.keep_failed;
                if let Some(job) = Self::fail_entry(&mut inner, &id, STALLED_ERROR, keep) {
                    report.failed.push(job);
                }
            } else {
                entry.job.state = JobState::Waiting;
                entry.due = now;
                entry.lease = None;
                report.requeued.push(id);
            }
        }

        if !report.requeued.is_empty() {
            self.notify.notify_one();
        }
        Ok(report)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut counts = QueueCounts::default();
        for entry in inner.jobs.values() {
            match entry.effective_state(now) {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("queue lock poisoned");
        Ok(inner.jobs.get(job_id).map(|e| e.snapshot(now)))
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{Backoff, RetryPolicy};

    fn options() -> QueueOptions {
        QueueOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Exponential { delay: Duration::from_secs(1) },
            },
            lock_duration: Duration::from_secs(60),
            max_stalled_count: 1,
            keep_completed: 2,
            keep_failed: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_fifo_order() {
        let queue = MemoryQueue::new(options());
        queue.enqueue("a").await.unwrap();
        queue.enqueue("b").await.unwrap();

        assert_eq!(queue.reserve().await.unwrap().unwrap().task_id, "a");
        assert_eq!(queue.reserve().await.unwrap().unwrap().task_id, "b");
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn active_job_is_not_delivered_twice() {
        let queue = MemoryQueue::new(options());
        queue.enqueue("a").await.unwrap();
        let lease = queue.reserve().await.unwrap().unwrap();
        assert!(queue.reserve().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().active, 1);
        assert!(queue.complete(&lease).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_exponentially() {
        let queue = MemoryQueue::new(options());
        queue.enqueue("a").await.unwrap();

        let first = queue.reserve().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        let outcome = queue.fail(&first, "boom").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying { next_attempt: 2, delay: Duration::from_secs(1) }
        );
        assert!(queue.reserve().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let second = queue.reserve().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        let outcome = queue.fail(&second, "boom again").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying { next_attempt: 3, delay: Duration::from_secs(2) }
        );

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(queue.reserve().await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(600)).await;
        let third = queue.reserve().await.unwrap().unwrap();
        assert!(third.is_final_attempt());

        let outcome = queue.fail(&third, "final").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 3 });

        let job = queue.get_job(&third.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("final"));
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_is_redelivered_then_failed() {
        let queue = MemoryQueue::new(options());
        queue.enqueue("slow").await.unwrap();
        let first = queue.reserve().await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = queue.recover_stalled().await.unwrap();
        assert_eq!(report.requeued, vec![first.job_id.clone()]);

        // The stale worker can no longer ack.
        assert!(!queue.complete(&first).await.unwrap());
        assert_eq!(queue.fail(&first, "late").await.unwrap(), FailOutcome::LeaseLost);

        let second = queue.reserve().await.unwrap().unwrap();
        assert_eq!(second.attempt, 1);
        assert_ne!(second.token, first.token);

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = queue.recover_stalled().await.unwrap();
        assert!(report.requeued.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].last_error.as_deref(), Some(STALLED_ERROR));
        assert_eq!(report.failed[0].task_id, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn unexpired_leases_are_left_alone() {
        let queue = MemoryQueue::new(options());
        queue.enqueue("a").await.unwrap();
        let _lease = queue.reserve().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(queue.recover_stalled().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_are_retained_up_to_limit() {
        let queue = MemoryQueue::new(options());
        let mut ids = Vec::new();
        for i in 0..4 {
            let job = queue.enqueue(&format!("t{i}")).await.unwrap();
            ids.push(job.id);
            let lease = queue.reserve().await.unwrap().unwrap();
            queue.complete(&lease).await.unwrap();
        }

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert!(queue.get_job(&ids[0]).await.unwrap().is_none());
        assert!(queue.get_job(&ids[1]).await.unwrap().is_none());
        assert_eq!(
            queue.get_job(&ids[3]).await.unwrap().unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_wakes_idle_waiter() {
        let queue = std::sync::Arc::new(MemoryQueue::new(options()));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                queue.wait_for_work(Duration::from_secs(30)).await;
                started.elapsed()
            })
        };
        tokio::task::yield_now().await;
        queue.enqueue("a").await.unwrap();
        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(30));
    }
}
