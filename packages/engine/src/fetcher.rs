//! Contract for the external URL fetcher.
//!
//! The engine never performs HTTP itself; workers hand each claimed URL to
//! an injected [`Warmer`] and persist whatever comes back. The concrete
//! crawler lives outside this crate.

use serde::{Deserialize, Serialize};

/// Connection-phase timings for a single request, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub dns_lookup: Option<i64>,
    pub tcp_connection: Option<i64>,
    pub tls_handshake: Option<i64>,
    pub ttfb: Option<i64>,
    pub content_transfer: Option<i64>,
}

/// Result of a revalidation probe issued after the initial warm request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevalidationProbe {
    pub response_time: Option<i64>,
    pub cache_status: Option<String>,
    pub timings: PhaseTimings,
}

/// Everything a warm request observed, persisted verbatim onto the task row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmResult {
    pub status_code: Option<i32>,
    /// Total wall-clock response time in milliseconds.
    pub response_time: i64,
    /// Edge cache verdict reported by the upstream (HIT, MISS, STALE, ...).
    pub cache_status: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    /// Response headers as an opaque JSON object; never parsed here.
    pub headers: Option<serde_json::Value>,
    pub redirect_url: Option<String>,
    pub timings: PhaseTimings,
    /// Second-request probe, when the fetcher revalidated the cache entry.
    pub second: Option<RevalidationProbe>,
    /// Sequence of prior cache probes, opaque to the engine.
    pub cache_check_attempts: Option<serde_json::Value>,
}

/// How a warm failure should be treated by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmFailure {
    /// Infrastructure-ish: timeouts, resets, 5xx storms. Worth a retry.
    Transient,
    /// The origin refused us (robots, auth walls, WAF). The task parks as
    /// `blocked` rather than burning retries.
    Blocked,
    /// Anything else; the task fails outright.
    Permanent,
}

/// Error returned by a [`Warmer`]. The message lands verbatim in
/// `task.error`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct WarmError {
    pub kind: WarmFailure,
    pub message: String,
}

impl WarmError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: WarmFailure::Transient,
            message: message.into(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            kind: WarmFailure::Blocked,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: WarmFailure::Permanent,
            message: message.into(),
        }
    }
}

/// The external crawler boundary: fetch one URL to pull it into the edge
/// cache, reporting timing and cache telemetry.
#[async_trait::async_trait]
pub trait Warmer: Send + Sync {
    async fn warm(&self, url: &str) -> Result<WarmResult, WarmError>;
}
