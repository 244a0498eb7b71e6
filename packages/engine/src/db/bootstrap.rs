//! Bootstrap: connect to the store with exponential backoff.
//!
//! Transient connection failures are retried with jittered exponential
//! backoff; configuration and authentication failures abort immediately.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::{Db, DbConfig};
use crate::error::{is_auth_error, QueueError};

/// Backoff policy for connection attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
    /// Fractional jitter applied symmetrically to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Base delay before the given retry (0-indexed), capped at
    /// `max_interval`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let millis = self.initial_interval.as_millis() as f64 * exp;
        Duration::from_millis(millis.min(self.max_interval.as_millis() as f64) as u64)
    }

    /// Jittered delay before the given retry.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = base * self.jitter;
        let jittered = base - spread + fastrand::f64() * spread * 2.0;
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Derive the attempt budget that fits inside `max_wait`, assuming
    /// worst-case (fully jittered-up) delays. Always at least one attempt.
    pub fn attempts_within(&self, max_wait: Duration) -> u32 {
        let mut spent = Duration::ZERO;
        let mut attempts = 1u32;
        loop {
            let next = self.base_delay(attempts - 1).mul_f64(1.0 + self.jitter);
            if spent + next > max_wait {
                return attempts;
            }
            spent += next;
            attempts += 1;
        }
    }

    fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Whether a connect failure is worth another attempt.
fn is_fatal(err: &QueueError) -> bool {
    match err {
        QueueError::Config(_) => true,
        QueueError::Unavailable { .. } => false,
        QueueError::PoolSaturated { .. } | QueueError::Cancelled { .. } => false,
        QueueError::Data { source, .. } => is_auth_error(source),
        QueueError::Migrate(_) => true,
    }
}

/// Connect with retries, respecting cancellation between attempts.
pub async fn connect_with_retry(
    config: &DbConfig,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Db, QueueError> {
    let mut attempt = 0u32;
    loop {
        match Db::connect(config).await {
            Ok(db) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "database connection established");
                }
                return Ok(db);
            }
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    tracing::error!(attempts = attempt, error = %err, "giving up on database connection");
                    return Err(err);
                }
                let delay = policy.delay(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "database connection failed; retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(QueueError::Cancelled { op: "connect" }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Convenience wrapper: keep retrying for up to `max_wait`, deriving the
/// attempt budget from the default policy's backoff series.
pub async fn wait_for_database(config: &DbConfig, max_wait: Duration) -> Result<Db, QueueError> {
    let base = RetryPolicy::default();
    let attempts = base.attempts_within(max_wait);
    let policy = base.with_max_attempts(attempts);
    connect_with_retry(config, &policy, &CancellationToken::new()).await
}
