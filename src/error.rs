//! Error types for dbkit.
//!
//! Every failure the data-access layer can report is a variant of [`DbError`].
//! Statement-level variants carry the SQL text and the number of bound
//! parameters so a log line identifies the failing call without exposing
//! parameter values.

use crate::db::sql::Sql;
use crate::models::TransactionState;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Malformed endpoint descriptor or unreachable endpoint.
    #[error("Connection failed: {message}")]
    Connect { message: String, suggestion: String },

    #[error("Connection pool exhausted: no connection available within {waited_ms}ms (max_open={max_open})")]
    PoolExhausted { max_open: u32, waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("No rows returned by [{sql}]")]
    NotFound { sql: Sql },

    #[error("Failed to map column '{column}' from [{sql}]: {message}")]
    Scan {
        sql: Sql,
        column: String,
        message: String,
    },

    #[error("Generated identifier not available for [{sql}]: {reason}")]
    NotApplicable { sql: Sql, reason: String },

    #[error("Statement failed [{sql}] with {param_count} parameter(s): {message}")]
    Statement {
        sql: Sql,
        param_count: usize,
        message: String,
        /// e.g. "23000" for an integrity constraint violation
        sql_state: Option<String>,
    },

    #[error("Parameter count mismatch for [{sql}]: expected {expected}, supplied {supplied}")]
    ParameterCount {
        sql: Sql,
        expected: usize,
        supplied: usize,
    },

    /// The session broke while a statement was in flight.
    #[error("Connection lost while running [{sql}]: {message}")]
    ConnectionLost { sql: Sql, message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Failed to begin transaction: {source}")]
    Begin {
        #[source]
        source: Box<DbError>,
    },

    #[error("Failed to commit transaction {transaction_id}: {source}")]
    Commit {
        transaction_id: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Transaction {transaction_id} is already {state}")]
    TransactionClosed {
        transaction_id: String,
        state: TransactionState,
    },

    #[error("Prepared statement [{sql}] is closed")]
    StatementClosed { sql: Sql },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn pool_exhausted(max_open: u32, waited: Duration) -> Self {
        Self::PoolExhausted {
            max_open,
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn not_found(sql: Sql) -> Self {
        Self::NotFound { sql }
    }

    pub fn scan(sql: Sql, column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Scan {
            sql,
            column: column.into(),
            message: message.into(),
        }
    }

    pub fn not_applicable(sql: Sql, reason: impl Into<String>) -> Self {
        Self::NotApplicable {
            sql,
            reason: reason.into(),
        }
    }

    pub fn parameter_count(sql: Sql, expected: usize, supplied: usize) -> Self {
        Self::ParameterCount {
            sql,
            expected,
            supplied,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn begin_failed(source: DbError) -> Self {
        Self::Begin {
            source: Box::new(source),
        }
    }

    pub fn commit_failed(transaction_id: impl Into<String>, source: DbError) -> Self {
        Self::Commit {
            transaction_id: transaction_id.into(),
            source: Box::new(source),
        }
    }

    pub fn transaction_closed(transaction_id: impl Into<String>, state: TransactionState) -> Self {
        Self::TransactionClosed {
            transaction_id: transaction_id.into(),
            state,
        }
    }

    pub fn statement_closed(sql: Sql) -> Self {
        Self::StatementClosed { sql }
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

    /// Map a driver error raised while running `sql` with `param_count` bound values.
    pub fn from_sqlx(err: sqlx::Error, sql: Sql, param_count: usize) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found(sql),
            sqlx::Error::ColumnNotFound(column) => {
                Self::scan(sql, column, "column not present in result set")
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => Self::scan(
                sql,
                format!("#{index}"),
                format!("index out of bounds (row has {len} columns)"),
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::scan(sql, index, source.to_string())
            }
            sqlx::Error::Decode(source) => Self::scan(sql, "?", source.to_string()),
            sqlx::Error::Database(db_err) => Self::Statement {
                sql,
                param_count,
                message: db_err.message().to_string(),
                sql_state: db_err.code().map(|c| c.to_string()),
            },
            sqlx::Error::Io(io_err) => Self::ConnectionLost {
                sql,
                message: format!("I/O error: {io_err}"),
            },
            sqlx::Error::Tls(tls_err) => Self::ConnectionLost {
                sql,
                message: format!("TLS error: {tls_err}"),
            },
            sqlx::Error::Protocol(msg) => Self::ConnectionLost {
                sql,
                message: format!("Protocol error: {msg}"),
            },
            sqlx::Error::WorkerCrashed => Self::ConnectionLost {
                sql,
                message: "database worker crashed".to_string(),
            },
            other => Self::Statement {
                sql,
                param_count,
                message: other.to_string(),
                sql_state: None,
            },
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connect { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Release connections sooner or raise max_open_connections")
            }
            Self::ParameterCount { .. } => {
                Some("Supply exactly one parameter per placeholder in the statement")
            }
            Self::Begin { source } | Self::Commit { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::Timeout { .. } | Self::ConnectionLost { .. }
        )
    }

    /// True when the session that produced this error can no longer be trusted
    /// and must be closed instead of returned to the pool.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } | Self::Timeout { .. } => true,
            Self::Begin { source } | Self::Commit { source, .. } => source.is_connection_broken(),
            _ => false,
        }
    }
}

/// Errors raised while establishing or validating a session, outside any statement.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => DbError::connection(
                db_err.message(),
                "Check the credentials and that the database exists",
            ),
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
            sqlx::Error::AnyDriverError(err) => DbError::connection(
                format!("Driver error: {}", err),
                "Check that the URL scheme names a supported backend (mysql, sqlite)",
            ),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    const SELECT_USER: Sql = Sql::new("SELECT id, name, age FROM users WHERE id = ?");

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection("refused", "Check that the MySQL server is running");
        assert_eq!(
            err.suggestion(),
            Some("Check that the MySQL server is running")
        );
        assert!(DbError::not_found(SELECT_USER).suggestion().is_none());
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", Duration::from_secs(30)).is_retryable());
        assert!(DbError::pool_exhausted(10, Duration::from_millis(250)).is_retryable());
        assert!(!DbError::not_found(SELECT_USER).is_retryable());
        assert!(!DbError::PoolClosed.is_retryable());
    }

    #[test]
    fn test_statement_errors_name_the_sql() {
        let err = DbError::parameter_count(SELECT_USER, 1, 2);
        let msg = err.to_string();
        assert!(msg.contains("WHERE id = ?"));
        assert!(msg.contains("expected 1, supplied 2"));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = DbError::from_sqlx(sqlx::Error::RowNotFound, SELECT_USER, 1);
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[test]
    fn test_io_error_marks_connection_broken() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = DbError::from_sqlx(sqlx::Error::Io(io), SELECT_USER, 1);
        assert!(matches!(err, DbError::ConnectionLost { .. }));
        assert!(err.is_connection_broken());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_commit_failure_wraps_cause() {
        let cause = DbError::timeout("COMMIT", Duration::from_secs(5));
        let err = DbError::commit_failed("tx_abc", cause);
        assert!(err.to_string().contains("tx_abc"));
        assert!(err.is_connection_broken());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_transaction_closed_names_state() {
        let err = DbError::transaction_closed("tx_1", TransactionState::Committed);
        assert_eq!(err.to_string(), "Transaction tx_1 is already committed");
    }

    #[test]
    fn test_pool_exhausted_reports_wait() {
        let err = DbError::pool_exhausted(2, Duration::from_millis(1500));
        assert!(err.to_string().contains("1500ms"));
        assert!(err.to_string().contains("max_open=2"));
    }
}
