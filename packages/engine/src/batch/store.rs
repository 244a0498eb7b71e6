//! Persistence side of the batch writer: grouped bulk UPDATEs plus the
//! waiting-task promotion pass, all inside one queue transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Acquire, PgConnection};

use super::Buckets;
use crate::error::QueueError;
use crate::events::{EngineEvent, EventSink};
use crate::models::{JobId, TaskUpdate};
use crate::queue::Queue;

/// Storage boundary for the batch writer. The flusher only ever calls
/// `flush`; everything about transactions, grouping, and promotion is the
/// implementation's business.
#[async_trait::async_trait]
pub trait UpdateStore: Send + Sync + 'static {
    /// Apply all updates atomically. Classified errors drive the writer's
    /// retry/isolation policy.
    async fn flush(&self, updates: &[TaskUpdate]) -> Result<(), QueueError>;
}

/// Postgres implementation: four grouped bulk UPDATEs and one promotion
/// call per affected job, in a single gated transaction.
pub struct PgUpdateStore {
    queue: Arc<Queue>,
    sink: Arc<dyn EventSink>,
}

impl PgUpdateStore {
    pub fn new(queue: Arc<Queue>, sink: Arc<dyn EventSink>) -> Self {
        Self { queue, sink }
    }
}

#[async_trait::async_trait]
impl UpdateStore for PgUpdateStore {
    async fn flush(&self, updates: &[TaskUpdate]) -> Result<(), QueueError> {
        if updates.is_empty() {
            return Ok(());
        }
        let buckets = Buckets::group(updates);
        let sink = self.sink.clone();
        self.queue
            .execute("flush_batch", move |conn| {
                Box::pin(async move {
                    apply_completed(conn, &buckets.completed).await?;
                    apply_failed(conn, &buckets.failed).await?;
                    apply_skipped(conn, &buckets.skipped).await?;
                    apply_retries(conn, &buckets.pending).await?;
                    for job_id in buckets.jobs_with_terminal() {
                        promote_waiting(conn, &job_id, sink.as_ref()).await;
                    }
                    Ok(())
                })
            })
            .await
    }
}

/// Completed tasks carry the full telemetry payload. JSON-valued columns
/// are normalised to `{}` / `[]` when the fetcher reported nothing.
async fn apply_completed(
    conn: &mut PgConnection,
    updates: &[TaskUpdate],
) -> Result<(), QueueError> {
    if updates.is_empty() {
        return Ok(());
    }

    let mut ids: Vec<&str> = Vec::with_capacity(updates.len());
    let mut observed: Vec<DateTime<Utc>> = Vec::with_capacity(updates.len());
    let mut status_codes: Vec<Option<i32>> = Vec::with_capacity(updates.len());
    let mut response_times: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut cache_statuses: Vec<Option<&str>> = Vec::with_capacity(updates.len());
    let mut content_types: Vec<Option<&str>> = Vec::with_capacity(updates.len());
    let mut content_lengths: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut headers: Vec<String> = Vec::with_capacity(updates.len());
    let mut redirects: Vec<Option<&str>> = Vec::with_capacity(updates.len());
    let mut dns: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut tcp: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut tls: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut ttfb: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut transfer: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut second_rt: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut second_cache: Vec<Option<&str>> = Vec::with_capacity(updates.len());
    let mut second_dns: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut second_tcp: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut second_tls: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut second_ttfb: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut second_transfer: Vec<Option<i64>> = Vec::with_capacity(updates.len());
    let mut attempts: Vec<String> = Vec::with_capacity(updates.len());

    let empty = crate::fetcher::WarmResult::default();
    for update in updates {
        let result = update.result.as_ref().unwrap_or(&empty);
        ids.push(update.task_id.as_str());
        observed.push(update.observed_at);
        status_codes.push(result.status_code);
        response_times.push(Some(result.response_time));
        cache_statuses.push(result.cache_status.as_deref());
        content_types.push(result.content_type.as_deref());
        content_lengths.push(result.content_length);
        headers.push(
            result
                .headers
                .as_ref()
                .map(|h| h.to_string())
                .unwrap_or_else(|| "{}".to_string()),
        );
        redirects.push(result.redirect_url.as_deref());
        dns.push(result.timings.dns_lookup);
        tcp.push(result.timings.tcp_connection);
        tls.push(result.timings.tls_handshake);
        ttfb.push(result.timings.ttfb);
        transfer.push(result.timings.content_transfer);
        let probe = result.second.as_ref();
        second_rt.push(probe.and_then(|p| p.response_time));
        second_cache.push(probe.and_then(|p| p.cache_status.as_deref()));
        second_dns.push(probe.and_then(|p| p.timings.dns_lookup));
        second_tcp.push(probe.and_then(|p| p.timings.tcp_connection));
        second_tls.push(probe.and_then(|p| p.timings.tls_handshake));
        second_ttfb.push(probe.and_then(|p| p.timings.ttfb));
        second_transfer.push(probe.and_then(|p| p.timings.content_transfer));
        attempts.push(
            result
                .cache_check_attempts
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "[]".to_string()),
        );
    }

    sqlx::query(
        r#"
        UPDATE tasks t
        SET status = 'completed',
            completed_at = u.observed_at,
            status_code = u.status_code,
            response_time = u.response_time,
            cache_status = u.cache_status,
            content_type = u.content_type,
            content_length = u.content_length,
            headers = u.headers::jsonb,
            redirect_url = u.redirect_url,
            dns_lookup_time = u.dns_lookup_time,
            tcp_connection_time = u.tcp_connection_time,
            tls_handshake_time = u.tls_handshake_time,
            ttfb = u.ttfb,
            content_transfer_time = u.content_transfer_time,
            second_response_time = u.second_response_time,
            second_cache_status = u.second_cache_status,
            second_dns_lookup_time = u.second_dns_lookup_time,
            second_tcp_connection_time = u.second_tcp_connection_time,
            second_tls_handshake_time = u.second_tls_handshake_time,
            second_ttfb = u.second_ttfb,
            second_content_transfer_time = u.second_content_transfer_time,
            cache_check_attempts = u.cache_check_attempts::jsonb,
            error = NULL
        FROM UNNEST(
            $1::text[], $2::timestamptz[], $3::int[], $4::bigint[], $5::text[],
            $6::text[], $7::bigint[], $8::text[], $9::text[], $10::bigint[],
            $11::bigint[], $12::bigint[], $13::bigint[], $14::bigint[],
            $15::bigint[], $16::text[], $17::bigint[], $18::bigint[],
            $19::bigint[], $20::bigint[], $21::bigint[], $22::text[]
        ) AS u(
            id, observed_at, status_code, response_time, cache_status,
            content_type, content_length, headers, redirect_url,
            dns_lookup_time, tcp_connection_time, tls_handshake_time, ttfb,
            content_transfer_time, second_response_time, second_cache_status,
            second_dns_lookup_time, second_tcp_connection_time,
            second_tls_handshake_time, second_ttfb,
            second_content_transfer_time, cache_check_attempts
        )
        WHERE t.id = u.id
        "#,
    )
    .bind(&ids)
    .bind(&observed)
    .bind(&status_codes)
    .bind(&response_times)
    .bind(&cache_statuses)
    .bind(&content_types)
    .bind(&content_lengths)
    .bind(&headers)
    .bind(&redirects)
    .bind(&dns)
    .bind(&tcp)
    .bind(&tls)
    .bind(&ttfb)
    .bind(&transfer)
    .bind(&second_rt)
    .bind(&second_cache)
    .bind(&second_dns)
    .bind(&second_tcp)
    .bind(&second_tls)
    .bind(&second_ttfb)
    .bind(&second_transfer)
    .bind(&attempts)
    .execute(conn)
    .await
    .map_err(|e| QueueError::from_sqlx("flush_completed", e))?;

    Ok(())
}

/// Failed and blocked tasks share one statement; the per-row status comes
/// from the unnest tuple.
async fn apply_failed(conn: &mut PgConnection, updates: &[TaskUpdate]) -> Result<(), QueueError> {
    if updates.is_empty() {
        return Ok(());
    }
    let ids: Vec<&str> = updates.iter().map(|u| u.task_id.as_str()).collect();
    let statuses: Vec<&str> = updates.iter().map(|u| u.status.as_str()).collect();
    let observed: Vec<DateTime<Utc>> = updates.iter().map(|u| u.observed_at).collect();
    let errors: Vec<Option<&str>> = updates.iter().map(|u| u.error.as_deref()).collect();
    let retries: Vec<i32> = updates.iter().map(|u| u.retry_count).collect();

    sqlx::query(
        r#"
        UPDATE tasks t
        SET status = u.status,
            completed_at = u.observed_at,
            error = u.error,
            retry_count = u.retry_count
        FROM UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::text[], $5::int[])
            AS u(id, status, observed_at, error, retry_count)
        WHERE t.id = u.id
        "#,
    )
    .bind(&ids)
    .bind(&statuses)
    .bind(&observed)
    .bind(&errors)
    .bind(&retries)
    .execute(conn)
    .await
    .map_err(|e| QueueError::from_sqlx("flush_failed", e))?;
    Ok(())
}

async fn apply_skipped(conn: &mut PgConnection, updates: &[TaskUpdate]) -> Result<(), QueueError> {
    if updates.is_empty() {
        return Ok(());
    }
    let ids: Vec<&str> = updates.iter().map(|u| u.task_id.as_str()).collect();
    sqlx::query("UPDATE tasks SET status = 'skipped', completed_at = NOW() WHERE id = ANY($1::text[])")
        .bind(&ids)
        .execute(conn)
        .await
        .map_err(|e| QueueError::from_sqlx("flush_skipped", e))?;
    Ok(())
}

/// Retry bookkeeping: the task goes back to `pending` with its bumped
/// retry count and a cleared start time.
async fn apply_retries(conn: &mut PgConnection, updates: &[TaskUpdate]) -> Result<(), QueueError> {
    if updates.is_empty() {
        return Ok(());
    }
    let ids: Vec<&str> = updates.iter().map(|u| u.task_id.as_str()).collect();
    let retries: Vec<i32> = updates.iter().map(|u| u.retry_count).collect();
    let errors: Vec<Option<&str>> = updates.iter().map(|u| u.error.as_deref()).collect();

    sqlx::query(
        r#"
        UPDATE tasks t
        SET status = 'pending',
            retry_count = u.retry_count,
            started_at = NULL,
            error = u.error
        FROM UNNEST($1::text[], $2::int[], $3::text[]) AS u(id, retry_count, error)
        WHERE t.id = u.id
        "#,
    )
    .bind(&ids)
    .bind(&retries)
    .bind(&errors)
    .execute(conn)
    .await
    .map_err(|e| QueueError::from_sqlx("flush_retries", e))?;
    Ok(())
}

/// One promotion attempt per job, inside the flush transaction but behind
/// a savepoint so a single failure cannot take the batch down with it.
async fn promote_waiting(conn: &mut PgConnection, job_id: &JobId, sink: &dyn EventSink) {
    let result = async {
        let mut savepoint = conn
            .begin()
            .await
            .map_err(|e| QueueError::from_sqlx("promote_waiting", e))?;
        sqlx::query_scalar::<_, i32>("SELECT promote_waiting_task_for_job($1)")
            .bind(job_id.as_str())
            .fetch_one(&mut *savepoint)
            .await
            .map_err(|e| QueueError::from_sqlx("promote_waiting", e))?;
        savepoint
            .commit()
            .await
            .map_err(|e| QueueError::from_sqlx("promote_waiting", e))?;
        Ok::<_, QueueError>(())
    }
    .await;

    if let Err(err) = result {
        tracing::warn!(job_id = %job_id, error = %err, "waiting-task promotion failed");
        sink.capture(EngineEvent::PromotionFailed {
            job_id: job_id.clone(),
            error: err.to_string(),
        });
    }
}
