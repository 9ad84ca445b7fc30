use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

pub type TaskId = String;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render an epoch-millisecond timestamp as a UTC datetime.
pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Whole milliseconds in `d`, saturating at `i64::MAX`.
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub fn new_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

// ── Status ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// ── Detection result ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Gender::Male => Gender::Female,
            Gender::Female => Gender::Male,
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            other => Err(CoreError::UnknownGender(other.to_string())),
        }
    }
}

/// One detected face mapped into the public result shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPerson {
    pub age: f64,
    pub gender: Gender,
    /// Score of the chosen gender category, 0.0..=1.0.
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub count: usize,
    pub persons: Vec<DetectedPerson>,
}

impl DetectionResult {
    pub fn from_persons(persons: Vec<DetectedPerson>) -> Self {
        Self {
            count: persons.len(),
            persons,
        }
    }
}

// ── Task record ───────────────────────────────────────────────

/// Lifecycle record of a single detection request.
///
/// `result` is only present on `Completed` tasks and `error` only on
/// `Failed` ones; [`DetectionTask::transition`] maintains both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionTask {
    pub id: TaskId,
    pub status: TaskStatus,
    pub artifact_path: String,
    pub result: Option<DetectionResult>,
    pub error: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub updated_at: i64,
}

impl DetectionTask {
    pub fn pending(id: impl Into<TaskId>, artifact_path: impl Into<String>) -> Self {
        Self::pending_at(id, artifact_path, now_millis())
    }

    pub fn pending_at(id: impl Into<TaskId>, artifact_path: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            artifact_path: artifact_path.into(),
            result: None,
            error: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Apply a status change at `now_ms`.
    ///
    /// `updated_at` strictly advances even when two transitions land in the
    /// same millisecond or the wall clock stepped backwards.
    pub fn transition(
        &mut self,
        status: TaskStatus,
        result: Option<DetectionResult>,
        error: Option<String>,
        now_ms: i64,
    ) {
        self.status = status;
        self.result = match status {
            TaskStatus::Completed => result,
            _ => None,
        };
        self.error = match status {
            TaskStatus::Failed => error,
            _ => None,
        };
        self.updated_at = now_ms.max(self.updated_at + 1);
    }

    pub fn is_expired(&self, now_ms: i64, max_age: Duration) -> bool {
        now_ms.saturating_sub(self.updated_at) >= duration_millis(max_age)
    }
}
