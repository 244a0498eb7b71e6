//! Durable cache-warming job engine.
//!
//! Given a set of discovered pages, the engine persists every URL as a
//! task, drives a pool of workers that hand each URL to an external
//! fetcher, and records per-request timing and cache-status telemetry
//! through a buffered batch writer.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool ──claim──► Queue ──► Db (admission-gated pool)
//!     │                   ▲
//!     │ warm (Warmer)     │ decrement_running
//!     ▼                   │
//! BatchWriter ──flush──► PgUpdateStore ──► Queue (single transaction)
//! ```
//!
//! The load-bearing pieces are the single-statement claim CTE
//! (`FOR UPDATE ... SKIP LOCKED` over both the task and its job), the
//! decrement-before-submit ordering in the worker loop, and the batch
//! writer's retry/isolation split between infrastructure and data
//! failures.

pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod models;
pub mod queue;
pub mod service;
pub mod worker;

pub use batch::{BatchConfig, BatchWriter, PgUpdateStore, UpdateStore};
pub use config::Config;
pub use db::bootstrap::{connect_with_retry, wait_for_database, RetryPolicy};
pub use db::gate::GateConfig;
pub use db::{Db, DbConfig, PoolStats};
pub use error::{ErrorClass, QueueError};
pub use events::{EngineEvent, EventSink, RecordingSink, TracingSink};
pub use fetcher::{PhaseTimings, RevalidationProbe, WarmError, WarmFailure, WarmResult, Warmer};
pub use models::{
    job_progress, ClaimedTask, Job, JobId, JobSpec, JobStatus, PageRef, TaskId, TaskStatus,
    TaskUpdate,
};
pub use queue::{Queue, Task, TaskBreakdown};
pub use service::{Engine, EngineBuilder};
pub use worker::{TaskSource, UpdateSink, WorkerConfig, WorkerPool};
