//! Error types for the connection coordinator.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Variants follow the coordinator's failure taxonomy: fatal construction errors,
//! recoverable per-call errors, programmer misuse, and cancellation. Degraded-but-safe
//! conditions (mode coercion, isolation degradation) are logged, never raised.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Transaction {transaction_id} is not active (state: {state})")]
    TransactionNotActive {
        transaction_id: String,
        state: String,
    },

    #[error("Timeout: {operation} exceeded {limit:?}")]
    Timeout { operation: String, limit: Duration },

    #[error("Operation canceled: {operation}")]
    Canceled { operation: String },

    #[error("Isolation level {level} is not supported by {product}")]
    UnsupportedIsolation { level: String, product: String },

    /// Coordinator construction failed; the wrapped error is the cause.
    #[error("Coordinator startup failed: {source}")]
    Startup {
        #[source]
        source: Box<DbError>,
    },

    #[error("Unsupported database product: {product}. {reason}")]
    UnsupportedProduct { product: String, reason: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Coordinator has been closed")]
    Closed,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Broad category of a [`DbError`], used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Coordinator construction cannot proceed.
    Fatal,
    /// The call failed; the coordinator remains usable.
    Recoverable,
    /// The caller used the API incorrectly.
    Misuse,
    /// A cooperative cancellation interrupted a wait.
    Canceled,
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an error for a completion attempted on a finished transaction.
    pub fn transaction_not_active(
        transaction_id: impl Into<String>,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::TransactionNotActive {
            transaction_id: transaction_id.into(),
            state: state.to_string(),
        }
    }

    /// Create a timeout error reporting the limit that was exceeded.
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit,
        }
    }

    /// Create a cancellation error.
    pub fn canceled(operation: impl Into<String>) -> Self {
        Self::Canceled {
            operation: operation.into(),
        }
    }

    /// Create an unsupported isolation level error.
    pub fn unsupported_isolation(
        level: impl std::fmt::Display,
        product: impl std::fmt::Display,
    ) -> Self {
        Self::UnsupportedIsolation {
            level: level.to_string(),
            product: product.to_string(),
        }
    }

    /// Create an unsupported product error.
    pub fn unsupported_product(
        product: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedProduct {
            product: product.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Mark an error raised while building the coordinator as fatal.
    ///
    /// Errors that are already fatal pass through unchanged.
    pub fn into_startup(self) -> Self {
        match self {
            Self::Startup { .. } | Self::UnsupportedProduct { .. } => self,
            other => Self::Startup {
                source: Box::new(other),
            },
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Startup { source } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable by the caller.
    ///
    /// The coordinator itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error is the cancellation condition.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Canceled { .. } => ErrorClass::Canceled,
            Self::UnsupportedProduct { .. } | Self::Startup { .. } => ErrorClass::Fatal,
            Self::TransactionNotActive { .. }
            | Self::UnsupportedIsolation { .. }
            | Self::InvalidInput { .. } => ErrorClass::Misuse,
            _ => ErrorClass::Recoverable,
        }
    }

    /// Check if the server rejected a prepared statement.
    ///
    /// Connection poolers in transaction mode lose named statements (26000/42P05),
    /// and some MySQL statements cannot go through the binary protocol.
    pub fn is_prepare_unsupported(&self) -> bool {
        match self {
            Self::Database {
                message, sql_state, ..
            } => {
                matches!(sql_state.as_deref(), Some("26000") | Some("42P05"))
                    || message
                        .to_ascii_lowercase()
                        .contains("not supported in the prepared statement protocol")
            }
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out waiting for a pooled connection",
                "Raise max_connections or acquire_timeout",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::invalid_input(
                format!("Column index {} out of bounds (len: {})", index, len),
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
