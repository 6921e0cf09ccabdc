//! Error types for the migration library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure should be treated by the stage that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Aborts the run before data movement; nothing is marked complete.
    Fatal,
    /// Infrastructure hiccup (connection loss, lock wait, deadlock). Retry.
    Transient,
    /// Caused by the data itself. Record it and move on.
    Permanent,
    /// Connection pool exhausted. Stop issuing new work, drain in-flight work.
    ResourceExhausted,
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database (MySQL) error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Target database (PostgreSQL) error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Timed out waiting for a pooled connection
    #[error("Connection pool exhausted: {context}")]
    PoolExhausted { context: String },

    /// A source column type has no target equivalent
    #[error("Cannot map type '{data_type}' of column {table}.{column}")]
    TypeMapping {
        table: String,
        column: String,
        data_type: String,
    },

    /// Target DDL for a table could not be applied
    #[error("Structure load failed for table {table}: {message}")]
    Structure { table: String, message: String },

    /// A transfer stream was cut short (reader vanished, channel closed)
    #[error("Transfer interrupted for table {table}: {message}")]
    Interrupted { table: String, message: String },

    /// A value could not be converted for the target
    #[error("Bad data in table {table}: {message}")]
    Data { table: String, message: String },

    /// Binary column decoding failed
    #[error("Binary decode failed for table {table}: {message}")]
    Decode { table: String, message: String },

    /// Persisted migration state is unusable
    #[error("State error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since the persisted run - cannot resume. Run `reset` to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        use deadpool_postgres::PoolError;
        match err {
            PoolError::Timeout(kind) => MigrateError::PoolExhausted {
                context: format!("timed out waiting for a target connection ({:?})", kind),
            },
            PoolError::Backend(e) => MigrateError::Target(e),
            other => MigrateError::pool(other, "acquiring target connection"),
        }
    }
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Structure error
    pub fn structure(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Structure {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create an Interrupted error
    pub fn interrupted(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Interrupted {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Data error
    pub fn data(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Data {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Decode error
    pub fn decode(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Decode {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Classify this error for retry decisions.
    pub fn class(&self) -> FailureClass {
        match self {
            MigrateError::Source(e) => classify_mysql(e),
            MigrateError::Target(e) => classify_postgres(e),
            MigrateError::Pool { .. } | MigrateError::Interrupted { .. } => FailureClass::Transient,
            MigrateError::PoolExhausted { .. } => FailureClass::ResourceExhausted,
            MigrateError::Data { .. } => FailureClass::Permanent,
            MigrateError::Config(_)
            | MigrateError::TypeMapping { .. }
            | MigrateError::Structure { .. }
            | MigrateError::Decode { .. }
            | MigrateError::State(_)
            | MigrateError::ConfigChanged
            | MigrateError::Io(_)
            | MigrateError::Yaml(_)
            | MigrateError::Json(_)
            | MigrateError::Cancelled => FailureClass::Fatal,
        }
    }

    /// True when the target reports that an object with the requested name
    /// already exists.
    ///
    /// DDL re-entered on a resumed run hits this. Whether the existing object
    /// is the one the statement would have created is for the caller to check.
    pub fn is_already_exists(&self) -> bool {
        self.sqlstate().map_or(false, is_duplicate_object_code)
    }

    /// True when the target rejects a second primary key on a table.
    pub fn is_duplicate_primary_key(&self) -> bool {
        self.sqlstate() == Some(SQLSTATE_INVALID_TABLE_DEFINITION)
    }

    fn sqlstate(&self) -> Option<&str> {
        match self {
            MigrateError::Target(e) => e.code().map(|code| code.code()),
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::ConfigChanged => 1,
            MigrateError::Source(_) | MigrateError::Target(_) => 2,
            MigrateError::Pool { .. } | MigrateError::PoolExhausted { .. } => 3,
            MigrateError::TypeMapping { .. } | MigrateError::Structure { .. } => 4,
            MigrateError::Interrupted { .. }
            | MigrateError::Data { .. }
            | MigrateError::Decode { .. } => 5,
            MigrateError::State(_) | MigrateError::Json(_) => 6,
            MigrateError::Io(_) => 7,
            MigrateError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// MySQL server error numbers worth retrying.
const MYSQL_LOCK_WAIT_TIMEOUT: u16 = 1205;
const MYSQL_DEADLOCK: u16 = 1213;
const MYSQL_SERVER_GONE: u16 = 2006;
const MYSQL_LOST_CONNECTION: u16 = 2013;
const MYSQL_TOO_MANY_CONNECTIONS: u16 = 1040;

fn classify_mysql(err: &sqlx::Error) -> FailureClass {
    match err {
        sqlx::Error::PoolTimedOut => FailureClass::ResourceExhausted,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FailureClass::Transient,
        sqlx::Error::Database(db) => {
            let number = db
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|e| e.number());
            match number {
                Some(MYSQL_LOCK_WAIT_TIMEOUT)
                | Some(MYSQL_DEADLOCK)
                | Some(MYSQL_SERVER_GONE)
                | Some(MYSQL_LOST_CONNECTION) => FailureClass::Transient,
                Some(MYSQL_TOO_MANY_CONNECTIONS) => FailureClass::ResourceExhausted,
                _ => FailureClass::Permanent,
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::RowNotFound => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}

/// Raised for a second primary key, among other malformed definitions.
const SQLSTATE_INVALID_TABLE_DEFINITION: &str = "42P16";

/// duplicate_object, duplicate_table
fn is_duplicate_object_code(code: &str) -> bool {
    matches!(code, "42710" | "42P07")
}

fn classify_postgres(err: &tokio_postgres::Error) -> FailureClass {
    let Some(code) = err.code() else {
        // No SQLSTATE: the connection itself failed.
        return FailureClass::Transient;
    };
    classify_sqlstate(code.code())
}

/// Classify a PostgreSQL SQLSTATE code.
pub(crate) fn classify_sqlstate(code: &str) -> FailureClass {
    match code {
        // lock_not_available
        "55P03" => FailureClass::Transient,
        // too_many_connections, insufficient_resources family
        c if c.starts_with("53") => FailureClass::ResourceExhausted,
        // connection exceptions, transaction rollbacks (deadlock, serialization),
        // operator intervention (admin shutdown, query cancelled)
        c if c.starts_with("08") || c.starts_with("40") || c.starts_with("57") => {
            FailureClass::Transient
        }
        _ => FailureClass::Permanent,
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify_sqlstate("40P01"), FailureClass::Transient);
        assert_eq!(classify_sqlstate("40001"), FailureClass::Transient);
        assert_eq!(classify_sqlstate("55P03"), FailureClass::Transient);
        assert_eq!(classify_sqlstate("08006"), FailureClass::Transient);
        assert_eq!(classify_sqlstate("57P01"), FailureClass::Transient);
        assert_eq!(classify_sqlstate("53300"), FailureClass::ResourceExhausted);
        assert_eq!(classify_sqlstate("23505"), FailureClass::Permanent);
        assert_eq!(classify_sqlstate("22P02"), FailureClass::Permanent);
    }

    #[test]
    fn test_duplicate_object_codes() {
        assert!(is_duplicate_object_code("42P07"));
        assert!(is_duplicate_object_code("42710"));
        // Invalid table definition covers more than a repeated primary key
        assert!(!is_duplicate_object_code(SQLSTATE_INVALID_TABLE_DEFINITION));
        assert!(!is_duplicate_object_code("23505"));
        assert!(!MigrateError::structure("t", "42P07").is_already_exists());
    }

    #[test]
    fn test_structural_errors_are_fatal() {
        let err = MigrateError::TypeMapping {
            table: "t".into(),
            column: "c".into(),
            data_type: "weird".into(),
        };
        assert_eq!(err.class(), FailureClass::Fatal);
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("t.c"));
    }

    #[test]
    fn test_transfer_error_classes() {
        assert_eq!(
            MigrateError::interrupted("t", "reader gone").class(),
            FailureClass::Transient
        );
        assert_eq!(
            MigrateError::data("t", "bad decimal").class(),
            FailureClass::Permanent
        );
        assert_eq!(
            MigrateError::PoolExhausted {
                context: "x".into()
            }
            .class(),
            FailureClass::ResourceExhausted
        );
        assert_eq!(
            MigrateError::Source(sqlx::Error::PoolTimedOut).class(),
            FailureClass::ResourceExhausted
        );
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = MigrateError::Config("source.host is required".into());
        assert!(err.format_detailed().starts_with("Error: Configuration error"));
    }
}
