//! Error types for db-router.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Registration errors are fatal at startup; scoping and migration errors surface
//! to the caller with enough context to act on (identifier, version, cause).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Duplicate identifier: '{identifier}' is already registered")]
    DuplicateIdentifier { identifier: String },

    #[error("Unknown identifier: no database registered as '{identifier}'")]
    UnknownIdentifier { identifier: String },

    #[error("Connection unavailable for '{identifier}': {message}")]
    ConnectionUnavailable { identifier: String, message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Migration {version} failed on '{identifier}': {cause}")]
    MigrationFailed {
        identifier: String,
        version: i64,
        cause: String,
    },

    #[error(
        "Inconsistent migration state on '{identifier}': migration {version} changed the schema but was not recorded. Resolve the ledger manually before re-running."
    )]
    InconsistentMigrationState { identifier: String, version: i64 },

    #[error("Invalid migration: {message}")]
    InvalidMigration { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RouterError {
    /// Create a duplicate identifier error.
    pub fn duplicate_identifier(identifier: impl Into<String>) -> Self {
        Self::DuplicateIdentifier {
            identifier: identifier.into(),
        }
    }

    /// Create an unknown identifier error.
    pub fn unknown_identifier(identifier: impl Into<String>) -> Self {
        Self::UnknownIdentifier {
            identifier: identifier.into(),
        }
    }

    /// Create a connection unavailable error.
    pub fn connection_unavailable(
        identifier: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ConnectionUnavailable {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a migration failure error.
    pub fn migration_failed(
        identifier: impl Into<String>,
        version: i64,
        cause: impl Into<String>,
    ) -> Self {
        Self::MigrationFailed {
            identifier: identifier.into(),
            version,
            cause: cause.into(),
        }
    }

    /// Create an inconsistent migration state error.
    pub fn inconsistent_state(identifier: impl Into<String>, version: i64) -> Self {
        Self::InconsistentMigrationState {
            identifier: identifier.into(),
            version,
        }
    }

    /// Create an invalid migration error.
    pub fn invalid_migration(message: impl Into<String>) -> Self {
        Self::InvalidMigration {
            message: message.into(),
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

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionUnavailable { .. }
        )
    }

    /// The migration version this error pinpoints, if any.
    pub fn failed_version(&self) -> Option<i64> {
        match self {
            Self::MigrationFailed { version, .. }
            | Self::InconsistentMigrationState { version, .. } => Some(*version),
            _ => None,
        }
    }
}

/// Convert sqlx errors to RouterError.
impl From<sqlx::Error> for RouterError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => RouterError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                RouterError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => RouterError::database("No rows returned", None),
            sqlx::Error::PoolTimedOut => RouterError::connection(
                "Connection pool acquire timed out",
                "Increase acquire_timeout or the pool size",
            ),
            sqlx::Error::PoolClosed => {
                RouterError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => RouterError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => RouterError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => RouterError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                RouterError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => RouterError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                RouterError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                RouterError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => RouterError::internal("Database worker crashed"),
            _ => RouterError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for routing and migration operations.
pub type RouterResult<T> = Result<T, RouterError>;
