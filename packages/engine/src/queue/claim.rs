//! The atomic claim protocol.
//!
//! A single CTE selects the best claimable task, locks both the task row
//! and its job row with `FOR UPDATE ... SKIP LOCKED`, marks the task
//! running, and bumps the job's `running_tasks`, all in one statement.
//! N workers contend only on distinct rows, never on a shared queue head.

use rust_decimal::Decimal;
use sqlx::{PgConnection, Row};

use crate::error::QueueError;
use crate::models::{ClaimedTask, JobId, TaskId};

/// One task is claimable when it is `pending`, its job is `running`, and
/// the job is under its concurrency ceiling (NULL or 0 means unlimited).
/// Priority first, oldest first; SKIP LOCKED means a momentarily locked
/// top row is passed over rather than waited on.
const CLAIM_SQL: &str = r#"
WITH picked AS (
    SELECT t.id, t.job_id, t.page_id, p.path, d.name AS domain,
           t.priority_score, t.retry_count, t.source_type, t.created_at
    FROM tasks t
    JOIN jobs j ON j.id = t.job_id
    JOIN pages p ON p.id = t.page_id
    JOIN domains d ON d.id = p.domain_id
    WHERE t.status = 'pending'
      AND j.status = 'running'
      AND (j.concurrency IS NULL OR j.concurrency = 0 OR j.running_tasks < j.concurrency)
      AND ($1::text IS NULL OR t.job_id = $1)
    ORDER BY t.priority_score DESC, t.created_at ASC
    LIMIT 1
    FOR UPDATE OF t, j SKIP LOCKED
), bumped AS (
    UPDATE jobs j
    SET running_tasks = j.running_tasks + 1
    FROM picked
    WHERE j.id = picked.job_id
)
UPDATE tasks t
SET status = 'running', started_at = NOW()
FROM picked
WHERE t.id = picked.id
RETURNING t.id, t.job_id, t.page_id, picked.path, picked.domain,
          picked.priority_score, picked.retry_count, picked.source_type,
          picked.created_at, t.started_at
"#;

pub(crate) async fn claim_next_in(
    conn: &mut PgConnection,
    job_filter: Option<String>,
) -> Result<Option<ClaimedTask>, QueueError> {
    let row = sqlx::query(CLAIM_SQL)
        .bind(job_filter)
        .fetch_optional(conn)
        .await
        .map_err(|e| QueueError::from_sqlx("claim_next", e))?;

    Ok(row.map(|r| ClaimedTask {
        id: TaskId(r.get("id")),
        job_id: JobId(r.get("job_id")),
        page_id: r.get("page_id"),
        path: r.get("path"),
        domain: r.get("domain"),
        priority_score: r.get::<Decimal, _>("priority_score"),
        retry_count: r.get("retry_count"),
        source_type: r.get("source_type"),
        created_at: r.get("created_at"),
        started_at: r.get("started_at"),
    }))
}
