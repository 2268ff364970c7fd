//! Error types for the replication pipeline
//!
//! One error enum shared by every crate in the workspace, with
//! classification helpers so callers can decide between retrying
//! (transient infrastructure), tolerating (poison payloads) and
//! surfacing (conflicts under the `error` policy).

use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Database errors (connection, query, transaction)
    Database,
    /// Bus errors (gateway connection, produce, fetch)
    Bus,
    /// Configuration errors (invalid or missing settings)
    Configuration,
    /// Event payload errors (malformed document, bad image shape)
    Payload,
    /// Conflict surfaced by the `error` resolution policy
    Conflict,
    /// Other/unknown errors
    Other,
}

/// Replication pipeline errors.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool error
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Bus transport error
    #[error("Bus error: {0}")]
    Bus(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Event document violates the per-operation shape contract
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Operation outside INSERT/UPDATE/DELETE
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Identifier unsafe to interpolate into SQL
    #[error("Invalid identifier: {0}")]
    Identifier(String),

    /// Row conflict under the `error` resolution policy
    #[error("Conflict on {table} id={key}: existing version {existing} >= incoming {incoming}")]
    Conflict {
        table: String,
        key: String,
        existing: i64,
        incoming: i64,
    },

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ReplicationError {
    /// Create a new pool error.
    pub fn pool(msg: impl Into<String>) -> Self {
        Self::Pool(msg.into())
    }

    /// Create a new bus error.
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    /// Create a new config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid-event error.
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is transient.
    ///
    /// Transient errors must not acknowledge the in-flight message; the
    /// bus or the next drain tick retries them once the dependency
    /// recovers.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Pool(_) | Self::Bus(_) | Self::Timeout(_) => true,

            Self::Postgres(e) => is_transient_pg_error(e),

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::TimedOut
                        | ErrorKind::UnexpectedEof
                        | ErrorKind::Interrupted
                )
            }

            Self::Config(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::InvalidEvent(_)
            | Self::UnknownOperation(_)
            | Self::Identifier(_)
            | Self::Conflict { .. }
            | Self::Other(_) => false,
        }
    }

    /// Check if this error marks a poison payload.
    ///
    /// Poison payloads are acknowledged and counted as failed so one bad
    /// message cannot stall a partition.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            Self::Json(_) | Self::InvalidEvent(_) | Self::UnknownOperation(_) | Self::Identifier(_)
        )
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Postgres(_) | Self::Pool(_) => ErrorCategory::Database,
            Self::Bus(_) | Self::Io(_) | Self::Timeout(_) => ErrorCategory::Bus,
            Self::Config(_) | Self::Yaml(_) => ErrorCategory::Configuration,
            Self::Json(_)
            | Self::InvalidEvent(_)
            | Self::UnknownOperation(_)
            | Self::Identifier(_) => ErrorCategory::Payload,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Other(_) => ErrorCategory::Other,
        }
    }
}

/// Check if a PostgreSQL error is transient via its SQLSTATE class.
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback: serialization failure, deadlock (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention (57xxx) - except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
        return false;
    }

    // No SQLSTATE: the connection itself broke
    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
