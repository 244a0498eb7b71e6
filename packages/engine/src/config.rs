//! Engine configuration loaded from environment variables.
//!
//! Everything is optional with defaults except the database target: either
//! `DATABASE_URL` (authoritative when present) or the discrete `DB_*`
//! fields must identify a server.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::batch::BatchConfig;
use crate::db::gate::GateConfig;
use crate::db::DbConfig;
use crate::worker::WorkerConfig;

/// Top-level configuration for the engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub gate: GateConfig,
    pub batch: BatchConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            db: DbConfig::from_env()?,
            gate: GateConfig::from_env()?,
            batch: BatchConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
        })
    }
}

/// Read an env var, falling back to a default when unset or empty.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid value, got {raw:?}")),
        _ => Ok(default),
    }
}

impl DbConfig {
    /// Assemble database configuration from the environment.
    ///
    /// `DATABASE_URL` wins when set; otherwise the discrete `DB_*` fields
    /// are used. Neither being present is a bootstrap error, caught later
    /// when connect options are built.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            host: env::var("DB_HOST").unwrap_or_default(),
            port: env_or("DB_PORT", 5432u16)?,
            user: env::var("DB_USER").unwrap_or_default(),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            name: env::var("DB_NAME").unwrap_or_default(),
            ssl_mode: env::var("DB_SSL_MODE").unwrap_or_else(|_| "prefer".to_string()),
            max_open: env_or("DB_MAX_OPEN", 25u32)?,
            max_idle: env_or("DB_MAX_IDLE", 5u32)?,
            max_lifetime: Duration::from_secs(env_or("DB_MAX_LIFETIME_SECS", 1800u64)?),
            statement_timeout: Duration::from_millis(env_or(
                "DB_STATEMENT_TIMEOUT_MS",
                60_000u64,
            )?),
        })
    }
}

impl GateConfig {
    pub fn from_env() -> Result<Self> {
        let warn = env_or("DB_POOL_WARN_THRESHOLD", 0.90f64)?;
        let reject = env_or("DB_POOL_REJECT_THRESHOLD", 0.95f64)?;
        let config = Self::new(warn, reject)?;
        Ok(config)
    }
}

impl BatchConfig {
    pub fn from_env() -> Result<Self> {
        let channel_capacity = env_or("BATCH_CHANNEL_SIZE", 1000usize)?;
        let interval_ms = env_or("BATCH_MAX_INTERVAL_MS", 2000u64)?;
        Ok(Self {
            channel_capacity,
            max_batch_interval: Duration::from_millis(interval_ms),
            ..Self::default()
        }
        .clamped())
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            worker_count: env_or("WORKER_COUNT", 5usize)?,
            ..Self::default()
        })
    }
}
