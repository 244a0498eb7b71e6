//! Engine assembly: wire configuration, store, queue, batch writer, and
//! worker pool into one startable unit.
//!
//! Embedders that want finer control can assemble the pieces themselves;
//! this module is the blessed ordering. Startup is store-first with
//! backoff, shutdown is reverse order: workers stop claiming, then the
//! batch writer drains, then the pool closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchWriter, PgUpdateStore};
use crate::config::Config;
use crate::db::bootstrap::{connect_with_retry, RetryPolicy};
use crate::db::Db;
use crate::error::QueueError;
use crate::events::{EventSink, TracingSink};
use crate::fetcher::Warmer;
use crate::queue::Queue;
use crate::worker::WorkerPool;

/// Interval between stuck-job sweeps.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// A fully wired engine.
pub struct Engine {
    queue: Arc<Queue>,
    writer: Arc<BatchWriter>,
    workers: WorkerPool,
    maintenance: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Builder for [`Engine`]; the warmer is the only mandatory collaborator.
pub struct EngineBuilder {
    config: Config,
    warmer: Arc<dyn Warmer>,
    sink: Arc<dyn EventSink>,
    retry: RetryPolicy,
    run_migrations: bool,
}

impl EngineBuilder {
    pub fn new(config: Config, warmer: Arc<dyn Warmer>) -> Self {
        Self {
            config,
            warmer,
            sink: Arc::new(TracingSink),
            retry: RetryPolicy::default(),
            run_migrations: true,
        }
    }

    /// Replace the default tracing sink with a custom anomaly receiver.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Skip schema migrations on startup (the embedder owns them).
    pub fn skip_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    /// Connect, migrate, and start everything.
    pub async fn start(self) -> Result<Engine, QueueError> {
        let cancel = CancellationToken::new();

        let db = connect_with_retry(&self.config.db, &self.retry, &cancel).await?;
        if self.run_migrations {
            db.migrate().await?;
        }
        tracing::info!(
            max_open = self.config.db.max_open,
            "database connected and schema ensured"
        );

        Ok(Engine::assemble(
            db,
            self.config,
            self.warmer,
            self.sink,
            cancel,
        ))
    }
}

impl Engine {
    /// Assemble around an already-open store. Used by `EngineBuilder` and
    /// by tests that manage their own pool.
    pub fn assemble(
        db: Db,
        config: Config,
        warmer: Arc<dyn Warmer>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Arc::new(Queue::new(db, config.gate, sink.clone()));
        let store = Arc::new(PgUpdateStore::new(queue.clone(), sink.clone()));
        let writer = Arc::new(BatchWriter::spawn(store, sink, config.batch));
        let workers = WorkerPool::start(queue.clone(), writer.clone(), warmer, config.worker);
        let maintenance = tokio::spawn(maintenance_loop(queue.clone(), cancel.clone()));

        tracing::info!("engine started");
        Self {
            queue,
            writer,
            workers,
            maintenance,
            cancel,
        }
    }

    /// The queue, for enqueuing work and reading job state.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// The batch writer handle, for out-of-pool result submission.
    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    /// Cooperative shutdown: stop claiming, drain the writer, stop
    /// housekeeping. Returns once every result submitted before the call
    /// has been handed to the store.
    pub async fn shutdown(self) {
        tracing::info!("engine shutting down");
        self.cancel.cancel();
        self.workers.stop().await;
        self.writer.stop().await;
        let _ = self.maintenance.await;
        tracing::info!("engine stopped");
    }
}

/// Periodic stuck-job sweep. Failures are logged and retried next tick;
/// the mutex inside `cleanup_stuck_jobs` keeps overlapping processes from
/// racing.
async fn maintenance_loop(queue: Arc<Queue>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match queue.cleanup_stuck_jobs().await {
                    Ok(0) => {}
                    Ok(repaired) => {
                        tracing::info!(repaired, "completed stuck jobs");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "stuck-job sweep failed");
                    }
                }
            }
        }
    }
}
