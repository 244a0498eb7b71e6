//! Store adapter: connection pool, schema migrations, and health probes.

pub mod bootstrap;
pub mod gate;

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use crate::error::QueueError;

/// Database connection configuration.
///
/// `url` is authoritative when present; otherwise the discrete fields are
/// assembled into connect options.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: String,
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Duration,
    /// Server-side statement timeout, appended to the connect options when
    /// the URL does not already carry one.
    pub statement_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: String::new(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            name: String::new(),
            ssl_mode: "prefer".to_string(),
            max_open: 25,
            max_idle: 5,
            max_lifetime: Duration::from_secs(1800),
            statement_timeout: Duration::from_secs(60),
        }
    }
}

impl DbConfig {
    /// Convenience constructor for a URL-only configuration.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    fn parse_ssl_mode(&self) -> Result<PgSslMode, QueueError> {
        match self.ssl_mode.as_str() {
            "disable" => Ok(PgSslMode::Disable),
            "allow" => Ok(PgSslMode::Allow),
            "prefer" | "" => Ok(PgSslMode::Prefer),
            "require" => Ok(PgSslMode::Require),
            "verify-ca" => Ok(PgSslMode::VerifyCa),
            "verify-full" => Ok(PgSslMode::VerifyFull),
            other => Err(QueueError::Config(format!("invalid ssl mode {other:?}"))),
        }
    }

    /// Build connect options, validating the configuration.
    pub fn connect_options(&self) -> Result<PgConnectOptions, QueueError> {
        let mut options = match &self.url {
            Some(url) => url
                .parse::<PgConnectOptions>()
                .map_err(|e| QueueError::Config(format!("invalid database URL: {e}")))?,
            None => {
                if self.host.is_empty() {
                    return Err(QueueError::Config(
                        "neither DATABASE_URL nor DB_HOST is set".to_string(),
                    ));
                }
                if self.name.is_empty() {
                    return Err(QueueError::Config("DB_NAME is not set".to_string()));
                }
                if self.port == 0 {
                    return Err(QueueError::Config("DB_PORT must be non-zero".to_string()));
                }
                PgConnectOptions::new()
                    .host(&self.host)
                    .port(self.port)
                    .username(&self.user)
                    .password(&self.password)
                    .database(&self.name)
                    .ssl_mode(self.parse_ssl_mode()?)
            }
        };

        let url_carries_timeout = self
            .url
            .as_deref()
            .map(|u| u.contains("statement_timeout"))
            .unwrap_or(false);
        if !url_carries_timeout {
            options = options.options([(
                "statement_timeout",
                self.statement_timeout.as_millis().to_string(),
            )]);
        }

        Ok(options)
    }
}

/// Snapshot of pool utilisation, for health reporting and the admission
/// gate.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub in_use: u32,
    pub idle: u32,
    pub max_open: u32,
}

impl PoolStats {
    pub fn usage(&self) -> f64 {
        if self.max_open == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.max_open as f64
    }
}

/// Handle to the connection pool plus the bits of configuration the rest of
/// the engine needs to sample it.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
    max_open: u32,
}

impl Db {
    /// Open the pool and verify connectivity with a single probe query.
    pub async fn connect(config: &DbConfig) -> Result<Self, QueueError> {
        let options = config.connect_options()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_open)
            .min_connections(config.max_idle.min(config.max_open))
            .max_lifetime(config.max_lifetime)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::from_sqlx("connect", e))?;

        let db = Self {
            pool,
            max_open: config.max_open,
        };
        db.probe().await?;
        Ok(db)
    }

    /// Wrap an already-open pool (tests, embedders).
    pub fn from_pool(pool: PgPool, max_open: u32) -> Self {
        Self { pool, max_open }
    }

    /// Apply the bundled migrations: tables, indexes, triggers, and the
    /// waiting-task promotion function. Idempotent.
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Single-statement connectivity probe.
    pub async fn probe(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::from_sqlx("probe", e))?;
        Ok(())
    }

    /// Probe plus a utilisation snapshot.
    pub async fn health_check(&self) -> Result<PoolStats, QueueError> {
        self.probe().await?;
        Ok(self.stats())
    }

    pub fn stats(&self) -> PoolStats {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolStats {
            in_use: size.saturating_sub(idle),
            idle,
            max_open: self.max_open,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn max_open(&self) -> u32 {
        self.max_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_config_is_authoritative() {
        let config = DbConfig {
            url: Some("postgres://user:pw@db.internal:6432/warm".to_string()),
            host: "ignored".to_string(),
            ..DbConfig::default()
        };
        assert!(config.connect_options().is_ok());
    }

    #[test]
    fn discrete_fields_require_host_and_name() {
        let config = DbConfig::default();
        let err = config.connect_options().unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));

        let config = DbConfig {
            host: "localhost".to_string(),
            ..DbConfig::default()
        };
        let err = config.connect_options().unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));

        let config = DbConfig {
            host: "localhost".to_string(),
            name: "warm".to_string(),
            user: "warm".to_string(),
            ..DbConfig::default()
        };
        assert!(config.connect_options().is_ok());
    }

    #[test]
    fn invalid_ssl_mode_is_config_error() {
        let config = DbConfig {
            host: "localhost".to_string(),
            name: "warm".to_string(),
            ssl_mode: "sideways".to_string(),
            ..DbConfig::default()
        };
        assert!(matches!(
            config.connect_options(),
            Err(QueueError::Config(_))
        ));
    }

    #[test]
    fn pool_stats_usage() {
        let stats = PoolStats {
            in_use: 9,
            idle: 1,
            max_open: 10,
        };
        assert!((stats.usage() - 0.9).abs() < f64::EPSILON);

        let empty = PoolStats {
            in_use: 0,
            idle: 0,
            max_open: 0,
        };
        assert_eq!(empty.usage(), 0.0);
    }
}
