//! Error types for the database access layer.
//!
//! All error variants are defined with `thiserror`. Startup-phase errors
//! (`Configuration`, warm-up `Connect`, `Schema`) abort construction of the
//! facade; per-operation errors are either returned to low-level callers or
//! collapsed into a boolean at the facade boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// The configuration snapshot is invalid (unsupported backend, bad pool
    /// sizing). Always fatal; surfaces before any connection attempt.
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// Establishing a physical connection failed. Fatal during pool warm-up,
    /// recoverable on later acquires.
    #[error("Failed to connect to database: {source}")]
    Connect {
        #[source]
        source: sqlx::Error,
    },

    /// No idle connection became available within the acquire timeout and the
    /// pool is at capacity. Transient; callers may retry with backoff.
    #[error("Connection pool exhausted. Max connections: {max}")]
    PoolExhausted { max: u32 },

    /// The pool has been shut down; no further checkouts are possible.
    #[error("Connection pool is shut down")]
    Shutdown,

    /// A schema-definition statement failed. The offending statement is
    /// identified by name, not full text.
    #[error("Schema statement '{statement}' failed: {source}")]
    Schema {
        statement: String,
        #[source]
        source: sqlx::Error,
    },

    /// A query or statement failed during execution.
    #[error("Query failed: {source}")]
    Query {
        #[source]
        source: sqlx::Error,
    },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connect error wrapping the underlying driver failure.
    pub fn connect(source: sqlx::Error) -> Self {
        Self::Connect { source }
    }

    /// Create a schema error naming the failed statement.
    pub fn schema(statement: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Schema {
            statement: statement.into(),
            source,
        }
    }

    /// Check if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Connect { .. })
    }

    /// Check if this error ends the pool's usefulness for the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Shutdown)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                DbError::Connect { source: err }
            }
            other => DbError::Query { source: other },
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
