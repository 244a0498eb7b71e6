//! Operational anomaly events and the injectable sink that receives them.
//!
//! The engine never reaches for a process-global reporter; anything a human
//! should wake up for flows through an [`EventSink`] handed in at
//! construction. The default sink logs through `tracing`.

use std::sync::Mutex;

use crate::models::{JobId, TaskId};

/// Critical anomalies emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The admission gate rejected a transaction.
    PoolSaturated { in_use: u32, max_open: u32 },
    /// A record failed persistence even in single-record isolation and was
    /// dropped.
    PoisonPill { task_id: TaskId, error: String },
    /// Shutdown drain exhausted its retries with updates still in memory.
    ShutdownFlushFailed { pending: usize, error: String },
    /// A waiting-task promotion failed; the rest of the batch committed.
    PromotionFailed { job_id: JobId, error: String },
}

/// Receiver for [`EngineEvent`]s. Implementations must be cheap and
/// non-blocking; the engine calls this from hot paths.
pub trait EventSink: Send + Sync {
    fn capture(&self, event: EngineEvent);
}

/// Default sink: structured error logs.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn capture(&self, event: EngineEvent) {
        match event {
            EngineEvent::PoolSaturated { in_use, max_open } => {
                tracing::error!(in_use, max_open, "connection pool saturated");
            }
            EngineEvent::PoisonPill { task_id, error } => {
                tracing::error!(task_id = %task_id, error = %error, "dropping poison task update");
            }
            EngineEvent::ShutdownFlushFailed { pending, error } => {
                tracing::error!(pending, error = %error, "shutdown flush failed; updates unpersisted");
            }
            EngineEvent::PromotionFailed { job_id, error } => {
                tracing::warn!(job_id = %job_id, error = %error, "waiting-task promotion failed");
            }
        }
    }
}

/// Sink that records every event; used by tests to assert on anomalies.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn poison_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, EngineEvent::PoisonPill { .. }))
            .count()
    }
}

impl EventSink for RecordingSink {
    fn capture(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}
