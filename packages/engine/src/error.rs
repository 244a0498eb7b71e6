//! Error taxonomy for the engine.
//!
//! Every store failure is classified exactly once, here, and the queue,
//! batch writer, and bootstrap all act on that classification:
//! infrastructure errors are retried, data errors are not, pool saturation
//! is a distinguished sentinel, and cancellation propagates unchanged.

use thiserror::Error;

/// Classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection-class trouble: refused/reset connections, broken pipes,
    /// timeouts, pool exhaustion, SQLSTATE classes 08/53/57/58. Retry.
    Transient,
    /// Integrity or data-exception class (SQLSTATE 22/23). Retrying the same
    /// payload will fail the same way.
    Data,
    /// Anything else (syntax errors, missing relations, driver bugs).
    /// Not retried; not poison-counted differently from data errors.
    Other,
}

/// SQLSTATE classes that indicate infrastructure rather than data trouble.
const TRANSIENT_SQLSTATE_CLASSES: [&str; 5] = [
    "08", // connection_exception
    "40", // transaction_rollback (deadlock_detected, serialization_failure)
    "53", // insufficient_resources ("too many clients" is 53300)
    "57", // operator_intervention
    "58", // system_error
];

/// SQLSTATE classes where the payload itself is at fault.
const DATA_SQLSTATE_CLASSES: [&str; 2] = [
    "22", // data_exception
    "23", // integrity_constraint_violation
];

/// Classify a SQLSTATE code by its two-character class.
pub fn classify_sqlstate(code: &str) -> ErrorClass {
    let class = &code[..code.len().min(2)];
    if TRANSIENT_SQLSTATE_CLASSES.contains(&class) {
        ErrorClass::Transient
    } else if DATA_SQLSTATE_CLASSES.contains(&class) {
        ErrorClass::Data
    } else {
        ErrorClass::Other
    }
}

/// Classify any sqlx error.
pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => classify_sqlstate(&code),
            None => ErrorClass::Other,
        },
        _ => ErrorClass::Other,
    }
}

/// SQLSTATE class 28 is invalid authorization; retrying a bad password is
/// pointless, so bootstrap aborts on it.
pub fn is_auth_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("28"))
            .unwrap_or(false),
        _ => false,
    }
}

/// Errors surfaced by the queue and its collaborators.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The admission gate refused the transaction before it started.
    #[error("connection pool saturated: {in_use}/{max_open} connections in use")]
    PoolSaturated { in_use: u32, max_open: u32 },

    /// Transient infrastructure failure; safe to retry.
    #[error("database unavailable during {op}")]
    Unavailable {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Data or integrity failure; retrying the same payload cannot succeed.
    #[error("data error during {op}")]
    Data {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Deadline elapsed or the surrounding context was cancelled.
    #[error("{op} cancelled or timed out")]
    Cancelled { op: &'static str },

    /// Bootstrap-time misconfiguration; fail fast, never retry.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Migration failure during schema setup.
    #[error("schema migration failed")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl QueueError {
    /// Wrap a sqlx error, routing it through the classifier.
    pub fn from_sqlx(op: &'static str, source: sqlx::Error) -> Self {
        match classify(&source) {
            ErrorClass::Transient => QueueError::Unavailable { op, source },
            ErrorClass::Data | ErrorClass::Other => QueueError::Data { op, source },
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Unavailable { .. }
                | QueueError::PoolSaturated { .. }
                | QueueError::Cancelled { .. }
        )
    }

    pub fn is_pool_saturated(&self) -> bool {
        matches!(self, QueueError::PoolSaturated { .. })
    }
}
