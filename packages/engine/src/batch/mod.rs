//! Buffered batch writer for task result updates.
//!
//! Workers submit [`TaskUpdate`]s onto a bounded channel; a single flusher
//! task buffers them and periodically applies the whole buffer in one
//! grouped transaction through an [`UpdateStore`]. Infrastructure failures
//! keep the batch in memory for the next tick; repeated data failures
//! switch to per-record isolation so one poison record cannot wedge its
//! batch-mates.

mod store;

pub use store::{PgUpdateStore, UpdateStore};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::events::{EngineEvent, EventSink};
use crate::models::{JobId, TaskStatus, TaskUpdate};

/// Upper bound for one flush attempt.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Batch writer tuning knobs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Force a flush once this many updates are buffered.
    pub max_batch_size: usize,
    /// Force a flush at this buffer age.
    pub max_batch_interval: Duration,
    /// Bounded channel capacity between workers and the flusher.
    pub channel_capacity: usize,
    /// Consecutive data-class flush failures before per-record isolation.
    pub max_consecutive_data_failures: u32,
    pub max_shutdown_retries: u32,
    pub shutdown_retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_interval: Duration::from_secs(2),
            channel_capacity: 1000,
            max_consecutive_data_failures: 3,
            max_shutdown_retries: 5,
            shutdown_retry_delay: Duration::from_millis(500),
        }
    }
}

impl BatchConfig {
    /// Clamp tunables into their supported ranges.
    pub fn clamped(mut self) -> Self {
        self.channel_capacity = self.channel_capacity.clamp(500, 20_000);
        self.max_batch_interval = Duration::from_millis(
            (self.max_batch_interval.as_millis() as u64).clamp(100, 10_000),
        );
        self
    }
}

/// Updates bucketed by terminal status for grouped persistence.
#[derive(Debug, Default)]
pub(crate) struct Buckets {
    pub completed: Vec<TaskUpdate>,
    pub failed: Vec<TaskUpdate>,
    pub skipped: Vec<TaskUpdate>,
    pub pending: Vec<TaskUpdate>,
}

impl Buckets {
    /// Bucket updates by status. `waiting` and `running` updates are caller
    /// bugs; submission refuses them, and any that slip through are
    /// dropped here with an error log.
    pub fn group(updates: &[TaskUpdate]) -> Self {
        let mut buckets = Self::default();
        for update in updates {
            match update.status {
                TaskStatus::Completed => buckets.completed.push(update.clone()),
                TaskStatus::Failed | TaskStatus::Blocked => buckets.failed.push(update.clone()),
                TaskStatus::Skipped => buckets.skipped.push(update.clone()),
                TaskStatus::Pending => buckets.pending.push(update.clone()),
                TaskStatus::Waiting | TaskStatus::Running => {
                    tracing::error!(
                        task_id = %update.task_id,
                        status = update.status.as_str(),
                        "non-writable status reached the batch writer; dropping"
                    );
                }
            }
        }
        buckets
    }

    /// Jobs that had at least one task reach a terminal state in this
    /// batch; each gets one waiting-task promotion attempt.
    pub fn jobs_with_terminal(&self) -> Vec<JobId> {
        let mut jobs: BTreeSet<String> = BTreeSet::new();
        for update in self
            .completed
            .iter()
            .chain(&self.failed)
            .chain(&self.skipped)
        {
            jobs.insert(update.job_id.0.clone());
        }
        jobs.into_iter().map(JobId).collect()
    }
}

/// Handle to the flusher task. Cloneable submission endpoint plus
/// cooperative shutdown.
pub struct BatchWriter {
    tx: mpsc::Sender<TaskUpdate>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Spawn the flusher and return the submission handle.
    pub fn spawn(
        store: Arc<dyn UpdateStore>,
        sink: Arc<dyn EventSink>,
        config: BatchConfig,
    ) -> Self {
        let config = config.clamped();
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let cancel = CancellationToken::new();
        let flusher = Flusher {
            rx,
            store,
            sink,
            config,
            cancel: cancel.clone(),
            buffer: Vec::new(),
            consecutive_data_failures: 0,
        };
        let handle = tokio::spawn(flusher.run());
        Self {
            tx,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Submit a result update. Returns immediately while channel capacity
    /// remains; blocks the submitter when the channel is full. Updates are
    /// never dropped.
    pub async fn submit(&self, update: TaskUpdate) {
        if matches!(update.status, TaskStatus::Waiting | TaskStatus::Running) {
            tracing::error!(
                task_id = %update.task_id,
                status = update.status.as_str(),
                "refusing non-writable status submission"
            );
            return;
        }
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update)) => {
                tracing::warn!(
                    capacity = self.tx.max_capacity(),
                    "batch channel full; submitter backpressured"
                );
                if self.tx.send(update).await.is_err() {
                    tracing::error!("batch writer stopped; update lost by late submitter");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("batch writer stopped; update lost by late submitter");
            }
        }
    }

    /// Stop the flusher: close the stop signal, drain the channel, flush
    /// what remains. Returns once the flusher task has exited.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct Flusher {
    rx: mpsc::Receiver<TaskUpdate>,
    store: Arc<dyn UpdateStore>,
    sink: Arc<dyn EventSink>,
    config: BatchConfig,
    cancel: CancellationToken,
    buffer: Vec<TaskUpdate>,
    consecutive_data_failures: u32,
}

impl Flusher {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.max_batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(update) => {
                        self.buffer.push(update);
                        if self.buffer.len() >= self.config.max_batch_size {
                            self.flush_buffer().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush_buffer().await;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// One flush attempt over the whole buffer. The buffer survives
    /// retryable failures untouched; data failures walk toward isolation.
    async fn flush_buffer(&mut self) {
        match self.try_flush().await {
            Ok(()) => {
                self.buffer.clear();
                self.consecutive_data_failures = 0;
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    buffered = self.buffer.len(),
                    error = %err,
                    "batch flush hit infrastructure trouble; will retry"
                );
            }
            Err(err) => {
                self.consecutive_data_failures += 1;
                tracing::error!(
                    buffered = self.buffer.len(),
                    consecutive = self.consecutive_data_failures,
                    error = %err,
                    "batch flush failed on data error"
                );
                if self.consecutive_data_failures >= self.config.max_consecutive_data_failures {
                    self.isolate().await;
                    self.consecutive_data_failures = 0;
                }
            }
        }
    }

    async fn try_flush(&self) -> Result<(), QueueError> {
        match tokio::time::timeout(FLUSH_TIMEOUT, self.store.flush(&self.buffer)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Cancelled { op: "flush_batch" }),
        }
    }

    /// Per-record isolation: one transaction per update. Records that fail
    /// on data grounds are poison and get dropped with a report;
    /// infrastructure failures keep their records for the next tick.
    async fn isolate(&mut self) {
        tracing::warn!(
            buffered = self.buffer.len(),
            "switching to individual-update isolation"
        );
        let pending = std::mem::take(&mut self.buffer);
        for update in pending {
            match self.store.flush(std::slice::from_ref(&update)).await {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    self.buffer.push(update);
                }
                Err(err) => {
                    tracing::error!(
                        task_id = %update.task_id,
                        error = %err,
                        "dropping poison task update"
                    );
                    self.sink.capture(EngineEvent::PoisonPill {
                        task_id: update.task_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    /// Final drain on shutdown: pull everything off the channel, then keep
    /// flushing until empty or out of retries.
    async fn drain(&mut self) {
        self.rx.close();
        while let Ok(update) = self.rx.try_recv() {
            self.buffer.push(update);
        }
        if self.buffer.is_empty() {
            return;
        }
        tracing::info!(buffered = self.buffer.len(), "draining batch writer");

        let mut last_error: Option<QueueError> = None;
        for attempt in 0..self.config.max_shutdown_retries {
            if self.buffer.is_empty() {
                break;
            }
            if attempt > 0 {
                tokio::time::sleep(self.config.shutdown_retry_delay).await;
            }
            match self.try_flush().await {
                Ok(()) => {
                    self.buffer.clear();
                    break;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(attempt, error = %err, "shutdown flush failed; retrying");
                    last_error = Some(err);
                }
                Err(err) => {
                    tracing::error!(attempt, error = %err, "shutdown flush hit data error; isolating");
                    last_error = Some(err);
                    self.isolate().await;
                }
            }
        }

        if !self.buffer.is_empty() {
            let error = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            self.sink.capture(EngineEvent::ShutdownFlushFailed {
                pending: self.buffer.len(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::models::TaskId;
    use std::sync::Mutex as StdMutex;

    fn update(status: TaskStatus, job: &str) -> TaskUpdate {
        TaskUpdate {
            task_id: TaskId::new(),
            job_id: JobId(job.to_string()),
            status,
            retry_count: 0,
            error: None,
            result: None,
            observed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn grouping_buckets_by_status() {
        let updates = vec![
            update(TaskStatus::Completed, "a"),
            update(TaskStatus::Failed, "a"),
            update(TaskStatus::Blocked, "b"),
            update(TaskStatus::Skipped, "b"),
            update(TaskStatus::Pending, "c"),
        ];
        let buckets = Buckets::group(&updates);
        assert_eq!(buckets.completed.len(), 1);
        assert_eq!(buckets.failed.len(), 2);
        assert_eq!(buckets.skipped.len(), 1);
        assert_eq!(buckets.pending.len(), 1);
        // Retry-pending does not trigger promotion; terminal ones do.
        let jobs = buckets.jobs_with_terminal();
        assert_eq!(jobs, vec![JobId("a".into()), JobId("b".into())]);
    }

    #[test]
    fn grouping_drops_waiting() {
        let buckets = Buckets::group(&[update(TaskStatus::Waiting, "a")]);
        assert!(buckets.completed.is_empty());
        assert!(buckets.failed.is_empty());
        assert!(buckets.skipped.is_empty());
        assert!(buckets.pending.is_empty());
    }

    #[test]
    fn config_clamps() {
        let config = BatchConfig {
            channel_capacity: 7,
            max_batch_interval: Duration::from_millis(1),
            ..BatchConfig::default()
        }
        .clamped();
        assert_eq!(config.channel_capacity, 500);
        assert_eq!(config.max_batch_interval, Duration::from_millis(100));

        let config = BatchConfig {
            channel_capacity: 100_000,
            max_batch_interval: Duration::from_secs(60),
            ..BatchConfig::default()
        }
        .clamped();
        assert_eq!(config.channel_capacity, 20_000);
        assert_eq!(config.max_batch_interval, Duration::from_secs(10));
    }

    /// Scriptable store fake: a queue of outcomes, then success.
    struct ScriptedStore {
        script: StdMutex<Vec<Result<(), &'static str>>>,
        flushed: StdMutex<Vec<Vec<TaskUpdate>>>,
    }

    impl ScriptedStore {
        fn new(script: Vec<Result<(), &'static str>>) -> Self {
            Self {
                script: StdMutex::new(script),
                flushed: StdMutex::new(Vec::new()),
            }
        }

        fn flushed_updates(&self) -> Vec<TaskUpdate> {
            self.flushed.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    #[async_trait::async_trait]
    impl UpdateStore for ScriptedStore {
        async fn flush(&self, updates: &[TaskUpdate]) -> Result<(), QueueError> {
            let outcome = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Ok(())
                } else {
                    script.remove(0)
                }
            };
            match outcome {
                Ok(()) => {
                    self.flushed.lock().unwrap().push(updates.to_vec());
                    Ok(())
                }
                Err("transient") => Err(QueueError::Unavailable {
                    op: "flush_batch",
                    source: sqlx::Error::PoolTimedOut,
                }),
                Err(_) => Err(QueueError::Data {
                    op: "flush_batch",
                    source: sqlx::Error::RowNotFound,
                }),
            }
        }
    }

    /// Store that rejects a specific task id with a data error.
    struct PoisonStore {
        poison: TaskId,
        flushed: StdMutex<Vec<TaskUpdate>>,
        batch_failures: StdMutex<u32>,
    }

    #[async_trait::async_trait]
    impl UpdateStore for PoisonStore {
        async fn flush(&self, updates: &[TaskUpdate]) -> Result<(), QueueError> {
            if updates.iter().any(|u| u.task_id == self.poison) {
                if updates.len() > 1 {
                    *self.batch_failures.lock().unwrap() += 1;
                }
                return Err(QueueError::Data {
                    op: "flush_batch",
                    source: sqlx::Error::RowNotFound,
                });
            }
            self.flushed.lock().unwrap().extend(updates.iter().cloned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn flushes_on_batch_size() {
        let store = Arc::new(ScriptedStore::new(vec![]));
        let sink = Arc::new(RecordingSink::new());
        let writer = BatchWriter::spawn(
            store.clone(),
            sink,
            BatchConfig {
                max_batch_size: 3,
                max_batch_interval: Duration::from_secs(10),
                ..BatchConfig::default()
            },
        );
        for _ in 0..3 {
            writer.submit(update(TaskStatus::Completed, "job")).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.flushed_updates().len(), 3);
        writer.stop().await;
    }

    #[tokio::test]
    async fn retryable_failure_keeps_batch() {
        let store = Arc::new(ScriptedStore::new(vec![
            Err("transient"),
            Err("transient"),
        ]));
        let sink = Arc::new(RecordingSink::new());
        let writer = BatchWriter::spawn(
            store.clone(),
            sink.clone(),
            BatchConfig {
                max_batch_size: 1,
                max_batch_interval: Duration::from_millis(100),
                ..BatchConfig::default()
            },
        );
        writer.submit(update(TaskStatus::Completed, "job")).await;
        // Two failed attempts, then the ticker retries and succeeds.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.flushed_updates().len(), 1);
        // Infrastructure failures are never poison.
        assert_eq!(sink.poison_count(), 0);
        writer.stop().await;
    }

    #[tokio::test]
    async fn poison_pill_is_isolated_and_dropped() {
        let poison = update(TaskStatus::Completed, "job");
        let store = Arc::new(PoisonStore {
            poison: poison.task_id.clone(),
            flushed: StdMutex::new(Vec::new()),
            batch_failures: StdMutex::new(0),
        });
        let sink = Arc::new(RecordingSink::new());
        let writer = BatchWriter::spawn(
            store.clone(),
            sink.clone(),
            BatchConfig {
                max_batch_size: 1000,
                max_batch_interval: Duration::from_millis(100),
                max_consecutive_data_failures: 3,
                ..BatchConfig::default()
            },
        );

        for _ in 0..5 {
            writer.submit(update(TaskStatus::Completed, "job")).await;
        }
        writer.submit(poison).await;

        // Three consecutive data failures, then isolation: five persist,
        // one dropped as poison.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.flushed.lock().unwrap().len(), 5);
        assert_eq!(sink.poison_count(), 1);
        assert!(*store.batch_failures.lock().unwrap() >= 3);
        writer.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_everything() {
        let store = Arc::new(ScriptedStore::new(vec![]));
        let sink = Arc::new(RecordingSink::new());
        let writer = BatchWriter::spawn(
            store.clone(),
            sink.clone(),
            BatchConfig {
                max_batch_size: 1000,
                max_batch_interval: Duration::from_secs(60),
                ..BatchConfig::default()
            },
        );
        for _ in 0..50 {
            writer.submit(update(TaskStatus::Completed, "job")).await;
        }
        writer.stop().await;
        assert_eq!(store.flushed_updates().len(), 50);
        assert_eq!(sink.events().len(), 0);
    }

    #[tokio::test]
    async fn shutdown_failure_reports_to_sink() {
        let store = Arc::new(ScriptedStore::new(vec![
            Err("transient"),
            Err("transient"),
            Err("transient"),
        ]));
        let sink = Arc::new(RecordingSink::new());
        let writer = BatchWriter::spawn(
            store.clone(),
            sink.clone(),
            BatchConfig {
                max_batch_size: 1000,
                max_batch_interval: Duration::from_secs(60),
                max_shutdown_retries: 3,
                shutdown_retry_delay: Duration::from_millis(10),
                ..BatchConfig::default()
            },
        );
        writer.submit(update(TaskStatus::Completed, "job")).await;
        writer.stop().await;
        let events = sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::ShutdownFlushFailed { pending: 1, .. })));
    }

    #[tokio::test]
    async fn waiting_submission_is_refused() {
        let store = Arc::new(ScriptedStore::new(vec![]));
        let sink = Arc::new(RecordingSink::new());
        let writer = BatchWriter::spawn(store.clone(), sink, BatchConfig::default());
        writer.submit(update(TaskStatus::Waiting, "job")).await;
        writer.stop().await;
        assert!(store.flushed_updates().is_empty());
    }
}
