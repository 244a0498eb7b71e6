//! Task read models: full telemetry rows and per-job breakdowns.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::error::QueueError;
use crate::fetcher::PhaseTimings;
use crate::models::{JobId, TaskId, TaskStatus};
use crate::queue::Queue;

/// A fully hydrated task row, result telemetry included.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub page_id: i64,
    pub status: TaskStatus,
    pub priority_score: Decimal,
    pub retry_count: i32,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_code: Option<i32>,
    pub response_time: Option<i64>,
    pub cache_status: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub headers: Option<serde_json::Value>,
    pub redirect_url: Option<String>,
    pub timings: PhaseTimings,
    pub second_response_time: Option<i64>,
    pub second_cache_status: Option<String>,
    pub second_timings: PhaseTimings,
    pub cache_check_attempts: serde_json::Value,
    pub error: Option<String>,
}

const TASK_COLUMNS: &str = r#"
    id, job_id, page_id, status, priority_score, retry_count,
    source_type, source_url, created_at, started_at, completed_at,
    status_code, response_time, cache_status, content_type, content_length,
    headers, redirect_url, dns_lookup_time, tcp_connection_time,
    tls_handshake_time, ttfb, content_transfer_time,
    second_response_time, second_cache_status, second_dns_lookup_time,
    second_tcp_connection_time, second_tls_handshake_time, second_ttfb,
    second_content_transfer_time, cache_check_attempts, error
"#;

fn task_from_row(row: &PgRow) -> Task {
    let status: String = row.get("status");
    Task {
        id: TaskId(row.get("id")),
        job_id: JobId(row.get("job_id")),
        page_id: row.get("page_id"),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        priority_score: row.get("priority_score"),
        retry_count: row.get("retry_count"),
        source_type: row.get("source_type"),
        source_url: row.get("source_url"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        status_code: row.get("status_code"),
        response_time: row.get("response_time"),
        cache_status: row.get("cache_status"),
        content_type: row.get("content_type"),
        content_length: row.get("content_length"),
        headers: row.get("headers"),
        redirect_url: row.get("redirect_url"),
        timings: PhaseTimings {
            dns_lookup: row.get("dns_lookup_time"),
            tcp_connection: row.get("tcp_connection_time"),
            tls_handshake: row.get("tls_handshake_time"),
            ttfb: row.get("ttfb"),
            content_transfer: row.get("content_transfer_time"),
        },
        second_response_time: row.get("second_response_time"),
        second_cache_status: row.get("second_cache_status"),
        second_timings: PhaseTimings {
            dns_lookup: row.get("second_dns_lookup_time"),
            tcp_connection: row.get("second_tcp_connection_time"),
            tls_handshake: row.get("second_tls_handshake_time"),
            ttfb: row.get("second_ttfb"),
            content_transfer: row.get("second_content_transfer_time"),
        },
        cache_check_attempts: row.get("cache_check_attempts"),
        error: row.get("error"),
    }
}

/// Per-status task counts for one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskBreakdown {
    pub pending: i64,
    pub running: i64,
    pub waiting: i64,
    pub completed: i64,
    pub failed: i64,
    pub blocked: i64,
    pub skipped: i64,
}

impl Queue {
    /// Fetch one task with its full result telemetry.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id.as_str())
            .fetch_optional(self.db().pool())
            .await
            .map_err(|e| QueueError::from_sqlx("get_task", e))?;
        Ok(row.as_ref().map(task_from_row))
    }

    /// Fetch a job's tasks, optionally filtered by status, newest first.
    pub async fn list_tasks(
        &self,
        job_id: &JobId,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<Task>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE job_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(job_id.as_str())
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(self.db().pool())
        .await
        .map_err(|e| QueueError::from_sqlx("list_tasks", e))?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    /// Count a job's tasks per status in one scan.
    pub async fn task_breakdown(&self, job_id: &JobId) -> Result<TaskBreakdown, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks WHERE job_id = $1 GROUP BY status",
        )
        .bind(job_id.as_str())
        .fetch_all(self.db().pool())
        .await
        .map_err(|e| QueueError::from_sqlx("task_breakdown", e))?;

        let mut breakdown = TaskBreakdown::default();
        for (status, count) in rows {
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => breakdown.pending = count,
                Some(TaskStatus::Running) => breakdown.running = count,
                Some(TaskStatus::Waiting) => breakdown.waiting = count,
                Some(TaskStatus::Completed) => breakdown.completed = count,
                Some(TaskStatus::Failed) => breakdown.failed = count,
                Some(TaskStatus::Blocked) => breakdown.blocked = count,
                Some(TaskStatus::Skipped) => breakdown.skipped = count,
                None => {}
            }
        }
        Ok(breakdown)
    }
}
