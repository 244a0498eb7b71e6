//! Cooperative worker pool.
//!
//! A fixed set of workers loops claim, warm, decrement, submit. The
//! decrement runs before the submit: the job's concurrency slot frees as
//! soon as the fetch ends, not after the batch writer gets around to
//! persisting the result. The claim protocol checks the counter, not the
//! persisted status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::fetcher::{WarmFailure, Warmer};
use crate::models::{ClaimedTask, JobId, TaskUpdate};

/// Source of claimable work; implemented by the queue.
#[async_trait::async_trait]
pub trait TaskSource: Send + Sync {
    async fn claim_next(&self, job_id: Option<&JobId>) -> Result<Option<ClaimedTask>, QueueError>;
    async fn decrement_running(&self, job_id: &JobId) -> Result<(), QueueError>;
}

/// Destination for result updates; implemented by the batch writer.
#[async_trait::async_trait]
pub trait UpdateSink: Send + Sync {
    async fn submit(&self, update: TaskUpdate);
}

#[async_trait::async_trait]
impl TaskSource for crate::queue::Queue {
    async fn claim_next(&self, job_id: Option<&JobId>) -> Result<Option<ClaimedTask>, QueueError> {
        crate::queue::Queue::claim_next(self, job_id).await
    }

    async fn decrement_running(&self, job_id: &JobId) -> Result<(), QueueError> {
        crate::queue::Queue::decrement_running(self, job_id).await
    }
}

#[async_trait::async_trait]
impl UpdateSink for crate::batch::BatchWriter {
    async fn submit(&self, update: TaskUpdate) {
        crate::batch::BatchWriter::submit(self, update).await;
    }
}

/// Worker pool tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Sleep after an empty claim, to avoid busy-waiting the store.
    pub quiet_period: Duration,
    /// Jittered sleep bounds after a claim or fetch error, in milliseconds.
    pub error_backoff_min_ms: u64,
    pub error_backoff_max_ms: u64,
    /// Transient warm failures below this retry count go back to pending.
    pub max_task_retries: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            quiet_period: Duration::from_millis(500),
            error_backoff_min_ms: 200,
            error_backoff_max_ms: 800,
            max_task_retries: 3,
        }
    }
}

impl WorkerConfig {
    fn error_backoff(&self) -> Duration {
        Duration::from_millis(fastrand::u64(
            self.error_backoff_min_ms..=self.error_backoff_max_ms,
        ))
    }
}

/// Fixed-size pool of claim/warm/submit workers.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the pool.
    pub fn start<S, U>(
        source: Arc<S>,
        sink: Arc<U>,
        warmer: Arc<dyn Warmer>,
        config: WorkerConfig,
    ) -> Self
    where
        S: TaskSource + 'static,
        U: UpdateSink + 'static,
    {
        let cancel = CancellationToken::new();
        let handles = (0..config.worker_count.max(1))
            .map(|id| {
                let source = source.clone();
                let sink = sink.clone();
                let warmer = warmer.clone();
                let config = config.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(id, source, sink, warmer, config, cancel).await;
                })
            })
            .collect();
        Self { cancel, handles }
    }

    /// Stop the pool: workers finish their current task, then exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop<S, U>(
    id: usize,
    source: Arc<S>,
    sink: Arc<U>,
    warmer: Arc<dyn Warmer>,
    config: WorkerConfig,
    cancel: CancellationToken,
) where
    S: TaskSource,
    U: UpdateSink,
{
    tracing::debug!(worker = id, "worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match source.claim_next(None).await {
            Ok(Some(task)) => {
                process_task(&*source, &*sink, &*warmer, &config, task).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.quiet_period) => {}
                }
            }
            Err(err) => {
                if !matches!(err, QueueError::Cancelled { .. }) {
                    tracing::warn!(worker = id, error = %err, "claim failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.error_backoff()) => {}
                }
            }
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

async fn process_task<S, U>(
    source: &S,
    sink: &U,
    warmer: &dyn Warmer,
    config: &WorkerConfig,
    task: ClaimedTask,
) where
    S: TaskSource + ?Sized,
    U: UpdateSink + ?Sized,
{
    let url = task.url();
    let update = match warmer.warm(&url).await {
        Ok(result) => TaskUpdate::completed(&task, result),
        Err(err) => {
            tracing::debug!(task_id = %task.id, url = %url, error = %err, "warm failed");
            match err.kind {
                WarmFailure::Transient if task.retry_count < config.max_task_retries => {
                    TaskUpdate::retry(&task, err.message)
                }
                WarmFailure::Blocked => TaskUpdate::blocked(&task, err.message),
                _ => TaskUpdate::failed(&task, err.message),
            }
        }
    };

    // Slot first, persistence second.
    if let Err(err) = source.decrement_running(&update.job_id).await {
        tracing::error!(job_id = %update.job_id, error = %err, "failed to decrement running counter");
    }
    sink.submit(update).await;
}
