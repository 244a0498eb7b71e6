//! End-to-end tests for the assembled engine: claim-to-persistence flow,
//! at-most-once under a crowd of workers, and the task read models.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use common::TestHarness;
use tokio_util::sync::CancellationToken;

use stoker_engine::{
    BatchConfig, Config, DbConfig, GateConfig, TaskStatus, WarmError, WarmResult, Warmer,
    WorkerConfig,
};

/// Counts how many times each URL was warmed.
struct CountingWarmer {
    seen: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl CountingWarmer {
    fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Warmer for CountingWarmer {
    async fn warm(&self, url: &str) -> Result<WarmResult, WarmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        Ok(WarmResult {
            status_code: Some(200),
            response_time: 10,
            cache_status: Some("HIT".to_string()),
            ..WarmResult::default()
        })
    }
}

fn engine_config(workers: usize) -> Config {
    Config {
        db: DbConfig::default(),
        gate: GateConfig::default(),
        batch: BatchConfig {
            max_batch_interval: Duration::from_millis(150),
            ..BatchConfig::default()
        },
        worker: WorkerConfig {
            worker_count: workers,
            quiet_period: Duration::from_millis(30),
            ..WorkerConfig::default()
        },
    }
}

#[tokio::test]
async fn assembled_engine_warms_each_url_exactly_once() -> Result<()> {
    let harness = TestHarness::new().await?;
    let (job_id, _) = harness.seed_job(20, None, 0).await?;

    let warmer = Arc::new(CountingWarmer::new());
    let engine = stoker_engine::Engine::assemble(
        harness.db.clone(),
        engine_config(8),
        warmer.clone(),
        harness.sink.clone(),
        CancellationToken::new(),
    );

    let mut progress = 0.0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        progress = engine.queue().get_job(&job_id).await?.unwrap().progress;
        if progress >= 100.0 {
            break;
        }
    }
    engine.shutdown().await;

    assert_eq!(progress, 100.0);
    // Every URL warmed exactly once: claims were at-most-once even with
    // eight workers racing.
    assert_eq!(warmer.calls.load(Ordering::SeqCst), 20);
    assert!(warmer.seen.lock().unwrap().values().all(|&n| n == 1));
    Ok(())
}

#[tokio::test]
async fn task_read_models_expose_telemetry() -> Result<()> {
    let harness = TestHarness::new().await?;
    let (job_id, _) = harness.seed_job(3, None, 0).await?;

    let warmer = Arc::new(CountingWarmer::new());
    let engine = stoker_engine::Engine::assemble(
        harness.db.clone(),
        engine_config(2),
        warmer,
        harness.sink.clone(),
        CancellationToken::new(),
    );
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if engine.queue().get_job(&job_id).await?.unwrap().progress >= 100.0 {
            break;
        }
    }

    let breakdown = engine.queue().task_breakdown(&job_id).await?;
    assert_eq!(breakdown.completed, 3);
    assert_eq!(breakdown.pending, 0);
    assert_eq!(breakdown.running, 0);

    let tasks = engine
        .queue()
        .list_tasks(&job_id, Some(TaskStatus::Completed), 10)
        .await?;
    assert_eq!(tasks.len(), 3);

    let task = engine.queue().get_task(&tasks[0].id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.status_code, Some(200));
    assert_eq!(task.cache_status.as_deref(), Some("HIT"));
    assert_eq!(task.response_time, Some(10));
    assert!(task.completed_at.is_some());

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_persists_everything_submitted_before_stop() -> Result<()> {
    let harness = TestHarness::new().await?;
    let (job_id, _) = harness.seed_job(10, None, 0).await?;

    // A long flush interval: nothing persists until the shutdown drain.
    let mut config = engine_config(4);
    config.batch.max_batch_interval = Duration::from_secs(9);

    let warmer = Arc::new(CountingWarmer::new());
    let engine = stoker_engine::Engine::assemble(
        harness.db.clone(),
        config,
        warmer.clone(),
        harness.sink.clone(),
        CancellationToken::new(),
    );

    // Wait for the workers to finish fetching, then stop before the first
    // ticker flush would fire.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if warmer.calls.load(Ordering::SeqCst) >= 10 {
            break;
        }
    }
    engine.shutdown().await;

    assert_eq!(harness.task_count(&job_id, "completed").await?, 10);
    let job = harness.queue.get_job(&job_id).await?.unwrap();
    assert_eq!(job.progress, 100.0);
    Ok(())
}
