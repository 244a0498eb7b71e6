//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test binary; the
//! schema is migrated once. Each test gets a fresh pool and queue and
//! keeps to its own uniquely named domains and jobs.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use stoker_engine::{
    Db, GateConfig, JobId, JobSpec, PageRef, Queue, RecordingSink,
};

struct SharedInfra {
    db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;
        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect for migrations")?;
        Db::from_pool(pool, 10)
            .migrate()
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

pub struct TestHarness {
    pub db: Db,
    pub queue: Arc<Queue>,
    pub sink: Arc<RecordingSink>,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        Self::with_gate(GateConfig::default(), 10).await
    }

    /// Harness with a dedicated pool size and gate thresholds, for
    /// admission tests.
    pub async fn with_gate(gate: GateConfig, max_open: u32) -> Result<Self> {
        let infra = SharedInfra::get().await;
        let pool = PgPoolOptions::new()
            .max_connections(max_open)
            .connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;
        let db = Db::from_pool(pool, max_open);
        let sink = Arc::new(RecordingSink::new());
        let queue = Arc::new(Queue::new(db.clone(), gate, sink.clone()));
        Ok(Self { db, queue, sink })
    }

    pub fn pool(&self) -> &PgPool {
        self.db.pool()
    }

    /// Create a domain, a batch of pages, and a running job with those
    /// pages enqueued. Returns the job id and the enqueued page refs.
    pub async fn seed_job(
        &self,
        page_count: usize,
        concurrency: Option<i32>,
        max_pages: i32,
    ) -> Result<(JobId, Vec<PageRef>)> {
        let domain = format!("{}.example.com", Uuid::new_v4());
        let domain_id = self.queue.upsert_domain(&domain).await?;

        let paths: Vec<String> = (0..page_count).map(|i| format!("/page/{i}")).collect();
        let pages = self.queue.upsert_pages(domain_id, paths).await?;
        let refs: Vec<PageRef> = pages
            .into_iter()
            .map(|(id, path)| PageRef::new(id, path, Decimal::from(1)))
            .collect();

        let job_id = self
            .queue
            .create_job(&JobSpec {
                domain_id,
                concurrency,
                max_pages,
                source_type: Some("sitemap".to_string()),
                ..JobSpec::default()
            })
            .await?;
        self.queue.start_job(&job_id).await?;
        self.queue
            .enqueue(&job_id, refs.clone(), "sitemap", &format!("https://{domain}/sitemap.xml"))
            .await?;

        Ok((job_id, refs))
    }

    /// Count tasks of a job by status.
    pub async fn task_count(&self, job_id: &JobId, status: &str) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE job_id = $1 AND status = $2",
        )
        .bind(job_id.as_str())
        .bind(status)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn running_tasks(&self, job_id: &JobId) -> Result<i32> {
        let value = sqlx::query_scalar("SELECT running_tasks FROM jobs WHERE id = $1")
            .bind(job_id.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(value)
    }
}
