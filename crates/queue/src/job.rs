//! Job, lease and outcome types shared by every queue backend.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use visage_core::config::QueueConfig;

use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    /// Waiting for a retry backoff to elapse.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task_id: String,
    pub state: JobState,
    /// Attempts that ran to a verdict (success or failure).
    pub attempts_made: u32,
    /// Times the job was recovered after its lease expired.
    pub stalled_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub(crate) fn new(task_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            state: JobState::Waiting,
            attempts_made: 0,
            stalled_count: 0,
            enqueued_at: Utc::now(),
            finished_at: None,
            last_error: None,
        }
    }
}

/// Exclusive, time-bounded claim on a job handed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: String,
    pub task_id: String,
    /// Fresh per delivery; acks carrying an older token are rejected.
    pub token: String,
    /// 1-based number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Lease {
    pub(crate) fn issue(job: &Job, max_attempts: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            task_id: job.task_id.clone(),
            token: Uuid::new_v4().to_string(),
            attempt: job.attempts_made + 1,
            max_attempts,
        }
    }

    /// Whether a failure of this delivery exhausts the job.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// What happened to a job after its handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for redelivery after `delay`.
    Retrying { next_attempt: u32, delay: Duration },
    /// Moved to the terminal failed state.
    Exhausted { attempts: u32 },
    /// The lease expired and the job was recovered by someone else.
    LeaseLost,
}

/// Result of a stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StallReport {
    /// Jobs put back for redelivery.
    pub requeued: Vec<String>,
    /// Jobs that stalled too often and were failed.
    pub failed: Vec<Job>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

pub const STALLED_ERROR: &str = "job stalled more than allowable limit";

/// Delivery settings shared by every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub retry: RetryPolicy,
    /// Lease length; an unacknowledged job is stalled after this long.
    pub lock_duration: Duration,
    /// Recoveries allowed before a stalled job is failed outright.
    pub max_stalled_count: u32,
    /// Completed jobs retained for inspection.
    pub keep_completed: usize,
    /// Failed jobs retained for inspection.
    pub keep_failed: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_duration: Duration::from_secs(5 * 60),
            max_stalled_count: 1,
            keep_completed: 100,
            keep_failed: 100,
        }
    }
}

impl QueueOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                backoff: Backoff::Exponential {
                    delay: Duration::from_millis(config.backoff_ms),
                },
            },
            lock_duration: Duration::from_millis(config.lock_ms),
            max_stalled_count: config.max_stalled_count,
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_tracks_attempt_number() {
        let mut job = Job::new("task-1");
        let first = Lease::issue(&job, 3);
        assert_eq!(first.attempt, 1);
        assert!(!first.is_final_attempt());

        job.attempts_made = 2;
        let last = Lease::issue(&job, 3);
        assert_eq!(last.attempt, 3);
        assert!(last.is_final_attempt());
        assert_ne!(first.token, last.token);
    }

    #[test]
    fn options_from_config_never_allow_zero_attempts() {
        let config = QueueConfig {
            max_attempts: 0,
            backoff_ms: 10,
            lock_ms: 1_000,
            stalled_interval_ms: 500,
            max_stalled_count: 1,
            keep_completed: 5,
            keep_failed: 5,
            poll_ms: 50,
        };
        let options = QueueOptions::from_config(&config);
        assert_eq!(options.retry.max_attempts, 1);
        assert_eq!(options.lock_duration, Duration::from_secs(1));
    }
}
