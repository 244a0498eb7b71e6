//! Pool admission gate.
//!
//! Before every non-maintenance transaction the queue samples pool
//! utilisation and either admits, warns, or rejects with a distinguished
//! [`QueueError::PoolSaturated`]. Maintenance work bypasses the gate so
//! housekeeping never starves behind a busy pool.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::db::PoolStats;
use crate::error::QueueError;
use crate::events::{EngineEvent, EventSink};

/// Log at most one line per anomaly per this window.
const LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Gate thresholds; `warn <= reject`, both in `(0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub warn_threshold: f64,
    pub reject_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 0.90,
            reject_threshold: 0.95,
        }
    }
}

impl GateConfig {
    pub fn new(warn_threshold: f64, reject_threshold: f64) -> Result<Self> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&warn_threshold) && (0.0..=1.0).contains(&reject_threshold),
            "pool thresholds must be within (0, 1], got warn={warn_threshold} reject={reject_threshold}"
        );
        anyhow::ensure!(
            warn_threshold <= reject_threshold,
            "warn threshold {warn_threshold} must not exceed reject threshold {reject_threshold}"
        );
        Ok(Self {
            warn_threshold,
            reject_threshold,
        })
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Admit,
    Warn { usage: f64 },
    Reject { in_use: u32, max_open: u32 },
}

/// Decide admission from a utilisation snapshot. Pure; the logging and
/// sink plumbing live on [`AdmissionGate`].
pub fn evaluate(stats: PoolStats, config: GateConfig) -> GateDecision {
    let usage = stats.usage();
    if usage >= config.reject_threshold {
        GateDecision::Reject {
            in_use: stats.in_use,
            max_open: stats.max_open,
        }
    } else if usage >= config.warn_threshold {
        GateDecision::Warn { usage }
    } else {
        GateDecision::Admit
    }
}

/// Stateful gate with rate-limited logging and sink reporting.
pub struct AdmissionGate {
    config: GateConfig,
    sink: Arc<dyn EventSink>,
    last_warn: Mutex<Option<Instant>>,
    last_reject: Mutex<Option<Instant>>,
}

impl AdmissionGate {
    pub fn new(config: GateConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            last_warn: Mutex::new(None),
            last_reject: Mutex::new(None),
        }
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Admit or reject a transaction attempt.
    pub fn check(&self, stats: PoolStats) -> Result<(), QueueError> {
        match evaluate(stats, self.config) {
            GateDecision::Admit => Ok(()),
            GateDecision::Warn { usage } => {
                if Self::should_log(&self.last_warn) {
                    tracing::warn!(
                        usage = format!("{:.0}%", usage * 100.0),
                        in_use = stats.in_use,
                        max_open = stats.max_open,
                        "connection pool nearing saturation"
                    );
                }
                Ok(())
            }
            GateDecision::Reject { in_use, max_open } => {
                if Self::should_log(&self.last_reject) {
                    tracing::error!(in_use, max_open, "rejecting transaction: pool saturated");
                    self.sink
                        .capture(EngineEvent::PoolSaturated { in_use, max_open });
                }
                Err(QueueError::PoolSaturated { in_use, max_open })
            }
        }
    }

    fn should_log(slot: &Mutex<Option<Instant>>) -> bool {
        let mut last = slot.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < LOG_INTERVAL => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
