//! Core data model: jobs, tasks, pages, and the in-process update record
//! that transits the batch writer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fetcher::WarmResult;

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// Task state.
///
/// `Waiting` is admitted-but-deferred: the task exists but its job was at
/// its concurrency ceiling when capacity was last evaluated. It is promoted
/// back to `Pending` by `promote_waiting_task_for_job` when a slot frees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "waiting" => Some(TaskStatus::Waiting),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "blocked" => Some(TaskStatus::Blocked),
            "skipped" => Some(TaskStatus::Skipped),
            _ => None,
        }
    }

    /// Terminal states never transition back to `Running`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Skipped
        )
    }
}

/// A page reference handed to `enqueue` by the discovery side
/// (sitemap parser or link follower).
#[derive(Debug, Clone, PartialEq)]
pub struct PageRef {
    pub page_id: i64,
    pub path: String,
    pub priority: Decimal,
}

impl PageRef {
    pub fn new(page_id: i64, path: impl Into<String>, priority: Decimal) -> Self {
        Self {
            page_id,
            path: path.into(),
            priority,
        }
    }
}

/// Parameters for creating a warming job.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub organisation_id: Option<String>,
    pub user_id: Option<String>,
    pub domain_id: i64,
    /// Maximum tasks simultaneously `running` for this job. `0` or `None`
    /// means unlimited.
    pub concurrency: Option<i32>,
    pub find_links: bool,
    /// `0` disables the cap.
    pub max_pages: i32,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
}

/// Read model for a job row. Counters are denormalised and maintained by
/// store-side triggers.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub organisation_id: Option<String>,
    pub user_id: Option<String>,
    pub domain_id: i64,
    pub status: JobStatus,
    pub total_tasks: i32,
    pub completed_tasks: i32,
    pub failed_tasks: i32,
    pub skipped_tasks: i32,
    pub sitemap_tasks: i32,
    pub found_tasks: i32,
    pub progress: f64,
    pub concurrency: Option<i32>,
    pub running_tasks: i32,
    pub find_links: bool,
    pub max_pages: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    /// Effective concurrency ceiling; `None` when unlimited.
    pub fn concurrency_limit(&self) -> Option<i32> {
        match self.concurrency {
            Some(c) if c > 0 => Some(c),
            _ => None,
        }
    }
}

/// A task claimed by a worker, joined with the page path and domain name
/// so the worker can assemble the URL without another round trip.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub page_id: i64,
    pub path: String,
    pub domain: String,
    pub priority_score: Decimal,
    pub retry_count: i32,
    pub source_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ClaimedTask {
    /// Assemble the fetchable URL for this task.
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("https://{}{}", self.domain, path)
    }
}

/// In-process result record handed from a worker to the batch writer.
///
/// Only terminal statuses and retry-pending reach the writer; `waiting`
/// updates are a caller bug and are rejected at submission.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub error: Option<String>,
    pub result: Option<WarmResult>,
    pub observed_at: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn completed(task: &ClaimedTask, result: WarmResult) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            status: TaskStatus::Completed,
            retry_count: task.retry_count,
            error: None,
            result: Some(result),
            observed_at: Utc::now(),
        }
    }

    pub fn failed(task: &ClaimedTask, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            status: TaskStatus::Failed,
            retry_count: task.retry_count,
            error: Some(error.into()),
            result: None,
            observed_at: Utc::now(),
        }
    }

    pub fn blocked(task: &ClaimedTask, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            status: TaskStatus::Blocked,
            retry_count: task.retry_count,
            error: Some(error.into()),
            result: None,
            observed_at: Utc::now(),
        }
    }

    pub fn skipped(task: &ClaimedTask) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            status: TaskStatus::Skipped,
            retry_count: task.retry_count,
            error: None,
            result: None,
            observed_at: Utc::now(),
        }
    }

    /// Send the task back to `pending` with its retry count bumped.
    pub fn retry(task: &ClaimedTask, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            status: TaskStatus::Pending,
            retry_count: task.retry_count + 1,
            error: Some(error.into()),
            result: None,
            observed_at: Utc::now(),
        }
    }

    /// Whether this update frees a concurrency slot permanently.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Job progress as a percentage, clamped to `[0, 100]`.
///
/// `progress = 100 * (completed + failed) / (total - skipped)`; the same law
/// is enforced store-side by the task counter trigger.
pub fn job_progress(completed: i32, failed: i32, total: i32, skipped: i32) -> f64 {
    let denominator = (total - skipped).max(1) as f64;
    let value = 100.0 * (completed + failed) as f64 / denominator;
    value.clamp(0.0, 100.0)
}
