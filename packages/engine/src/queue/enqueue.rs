//! Batched task enqueue.
//!
//! Pages arrive from discovery (sitemap or link following), get
//! deduplicated, partitioned against the job's `max_pages` cap, and land in
//! one array-unnest INSERT that is idempotent on `(job_id, page_id)`.

use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::error::QueueError;
use crate::models::{JobId, PageRef, TaskId, TaskStatus};

pub(crate) async fn enqueue_in(
    conn: &mut PgConnection,
    job_id: JobId,
    pages: Vec<PageRef>,
    source_type: String,
    source_url: String,
) -> Result<Vec<TaskId>, QueueError> {
    let pages = dedupe_pages(pages);
    if pages.is_empty() {
        return Ok(Vec::new());
    }

    // Lock the job row so concurrent enqueues compute the cap against a
    // stable count.
    let max_pages: i32 =
        sqlx::query_scalar("SELECT max_pages FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| QueueError::from_sqlx("enqueue", e))?
            .ok_or_else(|| QueueError::from_sqlx("enqueue", sqlx::Error::RowNotFound))?;

    let existing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE job_id = $1 AND status <> 'skipped'",
    )
    .bind(job_id.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| QueueError::from_sqlx("enqueue", e))?;

    let statuses = partition_statuses(pages.len(), max_pages, existing);

    let mut ids = Vec::with_capacity(pages.len());
    let mut page_ids = Vec::with_capacity(pages.len());
    let mut priorities = Vec::with_capacity(pages.len());
    let mut status_strs = Vec::with_capacity(pages.len());
    for (page, status) in pages.iter().zip(&statuses) {
        ids.push(TaskId::new().0);
        page_ids.push(page.page_id);
        priorities.push(page.priority);
        status_strs.push(status.as_str().to_string());
    }

    let inserted: Vec<String> = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (id, job_id, page_id, status, priority_score, source_type, source_url)
        SELECT u.id, $1, u.page_id, u.status, u.priority, $5, $6
        FROM UNNEST($2::text[], $3::bigint[], $4::numeric[], $7::text[])
            AS u(id, page_id, priority, status)
        ON CONFLICT (job_id, page_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(job_id.as_str())
    .bind(&ids)
    .bind(&page_ids)
    .bind(&priorities)
    .bind(&source_type)
    .bind(&source_url)
    .bind(&status_strs)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| QueueError::from_sqlx("enqueue", e))?;

    tracing::debug!(
        job_id = %job_id,
        offered = pages.len(),
        inserted = inserted.len(),
        "enqueued tasks"
    );

    Ok(inserted.into_iter().map(TaskId).collect())
}

/// Drop duplicate page ids, keeping the highest priority seen for each and
/// the first-seen position.
pub(crate) fn dedupe_pages(pages: Vec<PageRef>) -> Vec<PageRef> {
    let mut seen: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
    let mut out: Vec<PageRef> = Vec::with_capacity(pages.len());
    for page in pages {
        match seen.get(&page.page_id) {
            Some(&idx) => {
                if page.priority > out[idx].priority {
                    out[idx].priority = page.priority;
                }
            }
            None => {
                seen.insert(page.page_id, out.len());
                out.push(page);
            }
        }
    }
    out
}

/// Assign `pending` while the job is under its page cap, `skipped` beyond
/// it. `max_pages <= 0` disables the cap.
pub(crate) fn partition_statuses(count: usize, max_pages: i32, existing: i64) -> Vec<TaskStatus> {
    let budget = if max_pages <= 0 {
        usize::MAX
    } else {
        (max_pages as i64 - existing).max(0) as usize
    };
    (0..count)
        .map(|i| {
            if i < budget {
                TaskStatus::Pending
            } else {
                TaskStatus::Skipped
            }
        })
        .collect()
}
