//! Transactional task queue over Postgres.
//!
//! All mutating access to jobs and tasks flows through [`Queue`]: gated
//! transaction scopes, the atomic claim protocol, batched enqueue,
//! running-counter decrements, and stuck-job cleanup.

mod claim;
mod enqueue;
mod tasks;

pub use tasks::{Task, TaskBreakdown};

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::{PgConnection, Postgres, Transaction};
use tokio::sync::Mutex;

use crate::db::gate::{AdmissionGate, GateConfig};
use crate::db::Db;
use crate::error::QueueError;
use crate::events::EventSink;
use crate::models::{ClaimedTask, Job, JobId, JobSpec, JobStatus, PageRef, TaskId};

/// Default deadline applied to gated transactions when the caller brings
/// none of its own.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Local statement timeout for maintenance transactions.
const MAINTENANCE_STATEMENT_TIMEOUT: &str = "60s";

/// Postgres-backed transactional queue.
pub struct Queue {
    db: Db,
    gate: AdmissionGate,
    cleanup_lock: Mutex<()>,
}

impl Queue {
    pub fn new(db: Db, gate_config: GateConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            db,
            gate: AdmissionGate::new(gate_config, sink),
            cleanup_lock: Mutex::new(()),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Run `f` inside a transaction with the default deadline, gated by
    /// pool admission. Commits on `Ok`, rolls back on `Err`; rollback on
    /// drop is idempotent.
    pub async fn execute<T, F>(&self, op: &'static str, f: F) -> Result<T, QueueError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, QueueError>> + Send,
    {
        self.gate.check(self.db.stats())?;
        let work = async {
            let mut tx = self.begin(op).await?;
            match f(&mut *tx).await {
                Ok(value) => {
                    tx.commit()
                        .await
                        .map_err(|e| QueueError::from_sqlx(op, e))?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = tx.rollback().await;
                    Err(err)
                }
            }
        };
        match tokio::time::timeout(DEFAULT_DEADLINE, work).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Cancelled { op }),
        }
    }

    /// Run `f` inside a transaction that bypasses the admission gate and
    /// carries a tight local statement timeout, so housekeeping can always
    /// make progress on a saturated pool.
    pub async fn execute_maintenance<T, F>(&self, op: &'static str, f: F) -> Result<T, QueueError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, QueueError>> + Send,
    {
        let mut tx = self.begin(op).await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = '{MAINTENANCE_STATEMENT_TIMEOUT}'"
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| QueueError::from_sqlx(op, e))?;
        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| QueueError::from_sqlx(op, e))?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    async fn begin(&self, op: &'static str) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.db
            .pool()
            .begin()
            .await
            .map_err(|e| QueueError::from_sqlx(op, e))
    }

    /// Atomically claim the highest-priority claimable task, optionally
    /// constrained to one job. Returns `Ok(None)` when nothing is
    /// claimable; that is not an error.
    pub async fn claim_next(
        &self,
        job_id: Option<&JobId>,
    ) -> Result<Option<ClaimedTask>, QueueError> {
        let filter = job_id.map(|j| j.0.clone());
        self.execute("claim_next", move |conn| {
            Box::pin(claim::claim_next_in(conn, filter))
        })
        .await
    }

    /// Persist a batch of pages as tasks for a job. Deduplicates input,
    /// honours the job's `max_pages` cap (`0` = unlimited), and is
    /// idempotent on `(job_id, page_id)`. Returns ids of newly inserted
    /// tasks.
    pub async fn enqueue(
        &self,
        job_id: &JobId,
        pages: Vec<PageRef>,
        source_type: &str,
        source_url: &str,
    ) -> Result<Vec<TaskId>, QueueError> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let job = job_id.clone();
        let source_type = source_type.to_string();
        let source_url = source_url.to_string();
        self.execute("enqueue", move |conn| {
            Box::pin(enqueue::enqueue_in(conn, job, pages, source_type, source_url))
        })
        .await
    }

    /// Free one concurrency slot for a job. Called exactly once per
    /// terminal transition of a claimed task, before the result is handed
    /// to the batch writer. Clamped at zero against bookkeeping drift.
    pub async fn decrement_running(&self, job_id: &JobId) -> Result<(), QueueError> {
        sqlx::query("UPDATE jobs SET running_tasks = GREATEST(running_tasks - 1, 0) WHERE id = $1")
            .bind(job_id.as_str())
            .execute(self.db.pool())
            .await
            .map_err(|e| QueueError::from_sqlx("decrement_running", e))?;
        Ok(())
    }

    /// Complete jobs whose tasks are all accounted for but whose status
    /// never flipped (crashed flusher, missed trigger edge). Serialised
    /// process-locally; idempotent. Returns the number of jobs repaired.
    pub async fn cleanup_stuck_jobs(&self) -> Result<u64, QueueError> {
        let _guard = self.cleanup_lock.lock().await;
        self.execute_maintenance("cleanup_stuck_jobs", |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'completed',
                        progress = 100,
                        completed_at = COALESCE(completed_at, NOW())
                    WHERE total_tasks > 0
                      AND total_tasks = completed_tasks + failed_tasks
                      AND status IN ('pending', 'running')
                    "#,
                )
                .execute(&mut *conn)
                .await
                .map_err(|e| QueueError::from_sqlx("cleanup_stuck_jobs", e))?;
                Ok(result.rows_affected())
            })
        })
        .await
    }

    /// Insert a new warming job in `pending` state.
    pub async fn create_job(&self, spec: &JobSpec) -> Result<JobId, QueueError> {
        let id = JobId::new();
        let job_id = id.clone();
        let spec = spec.clone();
        self.execute("create_job", move |conn| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO jobs (
                        id, organisation_id, user_id, domain_id, status,
                        concurrency, find_links, max_pages,
                        include_paths, exclude_paths, source_type, source_url
                    )
                    VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(job_id.as_str())
                .bind(&spec.organisation_id)
                .bind(&spec.user_id)
                .bind(spec.domain_id)
                .bind(spec.concurrency)
                .bind(spec.find_links)
                .bind(spec.max_pages)
                .bind(serde_json::json!(spec.include_paths))
                .bind(serde_json::json!(spec.exclude_paths))
                .bind(&spec.source_type)
                .bind(&spec.source_url)
                .execute(&mut *conn)
                .await
                .map_err(|e| QueueError::from_sqlx("create_job", e))?;
                Ok(())
            })
        })
        .await?;
        Ok(id)
    }

    /// Move a pending job to `running`, making its tasks claimable.
    pub async fn start_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        sqlx::query("UPDATE jobs SET status = 'running' WHERE id = $1 AND status = 'pending'")
            .bind(job_id.as_str())
            .execute(self.db.pool())
            .await
            .map_err(|e| QueueError::from_sqlx("start_job", e))?;
        Ok(())
    }

    /// Cancel a job: flips `pending|running` jobs to `cancelled` and skips
    /// their not-yet-claimed tasks. Claimed tasks finish and persist
    /// normally.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let id = job_id.clone();
        self.execute("cancel_job", move |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    "UPDATE jobs SET status = 'cancelled' WHERE id = $1 AND status IN ('pending', 'running')",
                )
                .bind(id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(|e| QueueError::from_sqlx("cancel_job", e))?;
                if result.rows_affected() == 0 {
                    return Ok(false);
                }
                sqlx::query(
                    "UPDATE tasks SET status = 'skipped' WHERE job_id = $1 AND status IN ('pending', 'waiting')",
                )
                .bind(id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(|e| QueueError::from_sqlx("cancel_job", e))?;
                Ok(true)
            })
        })
        .await
    }

    /// Fetch a job read model.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, QueueError> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            SELECT id, organisation_id, user_id, domain_id, status,
                   total_tasks, completed_tasks, failed_tasks, skipped_tasks,
                   sitemap_tasks, found_tasks, progress, concurrency,
                   running_tasks, find_links, max_pages,
                   created_at, started_at, completed_at, error
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| QueueError::from_sqlx("get_job", e))?;

        Ok(row.map(|r| {
            let status: String = r.get("status");
            Job {
                id: JobId(r.get("id")),
                organisation_id: r.get("organisation_id"),
                user_id: r.get("user_id"),
                domain_id: r.get("domain_id"),
                status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
                total_tasks: r.get("total_tasks"),
                completed_tasks: r.get("completed_tasks"),
                failed_tasks: r.get("failed_tasks"),
                skipped_tasks: r.get("skipped_tasks"),
                sitemap_tasks: r.get("sitemap_tasks"),
                found_tasks: r.get("found_tasks"),
                progress: r.get("progress"),
                concurrency: r.get("concurrency"),
                running_tasks: r.get("running_tasks"),
                find_links: r.get("find_links"),
                max_pages: r.get("max_pages"),
                created_at: r.get("created_at"),
                started_at: r.get("started_at"),
                completed_at: r.get("completed_at"),
                error: r.get("error"),
            }
        }))
    }

    /// Insert or look up a domain by name.
    pub async fn upsert_domain(&self, name: &str) -> Result<i64, QueueError> {
        let name = name.to_string();
        self.execute("upsert_domain", move |conn| {
            Box::pin(async move {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO domains (name)
                    VALUES ($1)
                    ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                    RETURNING id
                    "#,
                )
                .bind(&name)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| QueueError::from_sqlx("upsert_domain", e))?;
                Ok(id)
            })
        })
        .await
    }

    /// Batch-upsert pages for a domain, returning `(page_id, path)` pairs
    /// for both inserted and pre-existing rows.
    pub async fn upsert_pages(
        &self,
        domain_id: i64,
        paths: Vec<String>,
    ) -> Result<Vec<(i64, String)>, QueueError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        self.execute("upsert_pages", move |conn| {
            Box::pin(async move {
                use sqlx::Row;

                let rows = sqlx::query(
                    r#"
                    WITH input AS (
                        SELECT DISTINCT u.path FROM UNNEST($2::text[]) AS u(path)
                    ), inserted AS (
                        INSERT INTO pages (domain_id, path)
                        SELECT $1, path FROM input
                        ON CONFLICT (domain_id, path) DO NOTHING
                        RETURNING id, path
                    )
                    SELECT id, path FROM inserted
                    UNION
                    SELECT p.id, p.path
                    FROM pages p
                    JOIN input i ON i.path = p.path
                    WHERE p.domain_id = $1
                    "#,
                )
                .bind(domain_id)
                .bind(&paths)
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| QueueError::from_sqlx("upsert_pages", e))?;

                Ok(rows
                    .into_iter()
                    .map(|r| (r.get::<i64, _>("id"), r.get::<String, _>("path")))
                    .collect())
            })
        })
        .await
    }
}
