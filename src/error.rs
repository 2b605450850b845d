//! Error taxonomy and the central driver-error classifier.
//!
//! Driver errors are interpreted exactly once, here, by SQLSTATE code
//! and error kind. Call sites never match on error message text.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the connection lifecycle subsystem.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed or missing configuration. The only fatal class:
    /// surfaced at startup, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport or auth failure while establishing or using a
    /// session. Retried by the reset policy.
    #[error("connection error: {source}")]
    Connection {
        #[source]
        source: sqlx::Error,
    },

    /// Stale prepared statement or other pooler-state mismatch.
    /// Always triggers forced teardown and retry.
    #[error("pooler protocol error: {source}")]
    Protocol {
        #[source]
        source: sqlx::Error,
    },

    /// A bounded operation exceeded its deadline. Surfaced directly;
    /// timeouts are not assumed transient. `elapsed` is the time the
    /// operation actually ran before it was cut off.
    #[error("timed out after {elapsed:?} during {context}")]
    Timeout { elapsed: Duration, context: String },

    /// The handle is usable but impaired (e.g. unexpected read-only
    /// state). Non-fatal; produced only when a caller opts into strict
    /// acquisition.
    #[error("handle degraded: {0}")]
    Degraded(String),

    /// A wrapped caller operation failed with a non-transient database
    /// error (syntax, constraint violation, missing row). Propagated on
    /// the first attempt, never retried.
    #[error("database operation failed: {source}")]
    Operation {
        #[source]
        source: sqlx::Error,
    },

    /// Retries exhausted. Carries the last underlying cause.
    #[error("service unavailable after {attempts} attempts: {source}")]
    ServiceUnavailable {
        attempts: u32,
        #[source]
        source: Box<LifecycleError>,
    },
}

/// Classification of a driver error, decided once at this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Prepared-statement collision / pooler state desync.
    Protocol,
    /// Peer closed or reset the connection.
    ConnectionReset,
    /// Authentication or session credentials no longer accepted.
    AuthExpired,
    /// The operation ran out of time.
    Timeout,
    /// Caller-level failure (syntax, constraint, missing row). Never
    /// retried.
    NonTransient,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorClass::Protocol | ErrorClass::ConnectionReset | ErrorClass::AuthExpired
        )
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Protocol => "protocol",
            ErrorClass::ConnectionReset => "connection_reset",
            ErrorClass::AuthExpired => "auth_expired",
            ErrorClass::Timeout => "timeout",
            ErrorClass::NonTransient => "non_transient",
        }
    }
}

/// Map a driver error into the taxonomy.
///
/// SQLSTATE references:
/// - `26000` invalid_sql_statement_name and `42P05`
///   duplicate_prepared_statement are the two faces of a pooler
///   reassigning the server connection between prepare and execute.
/// - `08P01` protocol_violation and the rest of class `08` are
///   connection failures.
/// - class `28` covers authorization failures (expired pooler auth
///   sessions included).
pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("26000") | Some("42P05") => ErrorClass::Protocol,
            Some("08P01") => ErrorClass::Protocol,
            Some(code) if code.starts_with("08") => ErrorClass::ConnectionReset,
            Some(code) if code.starts_with("28") => ErrorClass::AuthExpired,
            Some("57P01") | Some("57P02") | Some("57P03") => ErrorClass::ConnectionReset,
            _ => ErrorClass::NonTransient,
        },
        sqlx::Error::Protocol(_) => ErrorClass::Protocol,
        sqlx::Error::Io(_) => ErrorClass::ConnectionReset,
        sqlx::Error::Tls(_) => ErrorClass::ConnectionReset,
        sqlx::Error::PoolClosed => ErrorClass::ConnectionReset,
        sqlx::Error::WorkerCrashed => ErrorClass::ConnectionReset,
        sqlx::Error::PoolTimedOut => ErrorClass::Timeout,
        _ => ErrorClass::NonTransient,
    }
}

impl LifecycleError {
    /// Lift a driver error into the subsystem taxonomy.
    pub(crate) fn from_driver(err: sqlx::Error, elapsed: Duration, context: &str) -> Self {
        match classify(&err) {
            ErrorClass::Protocol => LifecycleError::Protocol { source: err },
            ErrorClass::Timeout => LifecycleError::Timeout {
                elapsed,
                context: context.to_string(),
            },
            ErrorClass::NonTransient => LifecycleError::Operation { source: err },
            _ => LifecycleError::Connection { source: err },
        }
    }

    /// Whether the reset policy should tear down and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LifecycleError::Connection { .. } | LifecycleError::Protocol { .. }
        )
    }
}
