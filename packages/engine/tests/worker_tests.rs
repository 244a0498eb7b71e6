//! End-to-end: worker pool + queue + batch writer against a real Postgres,
//! with a scripted fetcher standing in for the crawler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::TestHarness;
use serde_json::json;
use stoker_engine::{
    BatchConfig, BatchWriter, PgUpdateStore, WarmError, WarmResult, Warmer, WorkerConfig,
    WorkerPool,
};

/// Completes every URL except the ones listed as failures.
struct StubWarmer {
    fail_paths: Vec<String>,
}

#[async_trait::async_trait]
impl Warmer for StubWarmer {
    async fn warm(&self, url: &str) -> Result<WarmResult, WarmError> {
        if self.fail_paths.iter().any(|p| url.ends_with(p.as_str())) {
            return Err(WarmError::permanent("origin returned 500"));
        }
        Ok(WarmResult {
            status_code: Some(200),
            response_time: 42,
            cache_status: Some("MISS".to_string()),
            headers: Some(json!({"content-type": "text/html"})),
            ..WarmResult::default()
        })
    }
}

async fn wait_for_progress(harness: &TestHarness, job_id: &stoker_engine::JobId) -> Result<f64> {
    let mut progress = 0.0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let job = harness.queue.get_job(job_id).await?.unwrap();
        progress = job.progress;
        if progress >= 100.0 {
            break;
        }
    }
    Ok(progress)
}

#[tokio::test]
async fn pool_warms_whole_job_to_completion() -> Result<()> {
    let harness = TestHarness::new().await?;
    let (job_id, _) = harness.seed_job(6, Some(2), 0).await?;

    let store = Arc::new(PgUpdateStore::new(
        harness.queue.clone(),
        harness.sink.clone(),
    ));
    let writer = Arc::new(BatchWriter::spawn(
        store,
        harness.sink.clone(),
        BatchConfig {
            max_batch_interval: Duration::from_millis(200),
            ..BatchConfig::default()
        },
    ));
    let pool = WorkerPool::start(
        harness.queue.clone(),
        writer.clone(),
        Arc::new(StubWarmer {
            fail_paths: vec!["/page/3".to_string()],
        }),
        WorkerConfig {
            worker_count: 3,
            quiet_period: Duration::from_millis(50),
            ..WorkerConfig::default()
        },
    );

    let progress = wait_for_progress(&harness, &job_id).await?;
    pool.stop().await;
    writer.stop().await;

    assert_eq!(progress, 100.0);
    let job = harness.queue.get_job(&job_id).await?.unwrap();
    assert_eq!(job.status.as_str(), "completed");
    assert_eq!(job.completed_tasks, 5);
    assert_eq!(job.failed_tasks, 1);
    assert_eq!(job.running_tasks, 0);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    // Telemetry landed on the completed rows.
    let cache_statuses: Vec<String> = sqlx::query_scalar(
        "SELECT cache_status FROM tasks WHERE job_id = $1 AND status = 'completed'",
    )
    .bind(job_id.as_str())
    .fetch_all(harness.pool())
    .await?;
    assert_eq!(cache_statuses.len(), 5);
    assert!(cache_statuses.iter().all(|s| s == "MISS"));

    // The failed row carries the fetcher's message verbatim.
    let error: String = sqlx::query_scalar(
        "SELECT error FROM tasks WHERE job_id = $1 AND status = 'failed'",
    )
    .bind(job_id.as_str())
    .fetch_one(harness.pool())
    .await?;
    assert_eq!(error, "origin returned 500");
    Ok(())
}

#[tokio::test]
async fn concurrency_ceiling_holds_under_live_load() -> Result<()> {
    let harness = TestHarness::new().await?;
    let (job_id, _) = harness.seed_job(10, Some(2), 0).await?;

    struct SlowWarmer;
    #[async_trait::async_trait]
    impl Warmer for SlowWarmer {
        async fn warm(&self, _url: &str) -> Result<WarmResult, WarmError> {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(WarmResult {
                status_code: Some(200),
                ..WarmResult::default()
            })
        }
    }

    let store = Arc::new(PgUpdateStore::new(
        harness.queue.clone(),
        harness.sink.clone(),
    ));
    let writer = Arc::new(BatchWriter::spawn(
        store,
        harness.sink.clone(),
        BatchConfig {
            max_batch_interval: Duration::from_millis(100),
            ..BatchConfig::default()
        },
    ));
    let pool = WorkerPool::start(
        harness.queue.clone(),
        writer.clone(),
        Arc::new(SlowWarmer),
        WorkerConfig {
            worker_count: 6,
            quiet_period: Duration::from_millis(20),
            ..WorkerConfig::default()
        },
    );

    // Sample the live counter while the job runs; the ceiling must hold at
    // every observation.
    let mut max_seen = 0;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let running = harness.running_tasks(&job_id).await?;
        max_seen = max_seen.max(running);
        let job = harness.queue.get_job(&job_id).await?.unwrap();
        if job.progress >= 100.0 {
            break;
        }
    }
    pool.stop().await;
    writer.stop().await;

    assert!(max_seen <= 2, "running_tasks peaked at {max_seen}");
    let job = harness.queue.get_job(&job_id).await?.unwrap();
    assert_eq!(job.status.as_str(), "completed");
    Ok(())
}
