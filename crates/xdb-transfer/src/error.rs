//! Error types for the export/import engine.

use thiserror::Error;

use crate::codec::DecodeError;

/// Main error type for export and import operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A provider connection could not be opened.
    #[error("Cannot connect to {provider}: {message}")]
    Connection { provider: String, message: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    MySql(#[from] sqlx::Error),

    /// Catalog introspection failed
    #[error("Schema extraction failed: {0}")]
    SchemaExtraction(String),

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// A lower-level failure annotated with where it happened.
    #[error("{phase} failed for {table}{}: {source}", .batch.map(|b| format!(" (batch {})", b)).unwrap_or_default())]
    Context {
        table: String,
        phase: String,
        batch: Option<usize>,
        #[source]
        source: Box<MigrateError>,
    },

    /// A batch file is structurally invalid.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Manifest missing, unreadable or inconsistent
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// CREATE of an object that already exists
    #[error("Object already exists: {0}")]
    ObjectExists(String),

    /// Primary key, foreign key or identity rule rejected the data
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Connection hiccup or similar failure worth retrying
    #[error("Transient error: {0}")]
    Transient(String),

    /// An operation exceeded its command timeout
    #[error("Timed out after {seconds:.1}s: {operation}")]
    Timeout { operation: String, seconds: f64 },

    /// Export validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,
}

/// Process exit codes reported by the CLI.
pub mod exit_codes {
    pub const CONFIG: u8 = 1;
    pub const CONNECTION: u8 = 2;
    pub const DATA: u8 = 3;
    pub const TRANSFER: u8 = 4;
    pub const VALIDATION: u8 = 5;
    pub const CANCELLED: u8 = 6;
    pub const IO: u8 = 7;
    pub const OTHER: u8 = 8;
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Connection error
    pub fn connection(provider: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Connection {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// Wrap this error with the table, phase and batch it occurred in.
    ///
    /// Cancellation is never wrapped so callers can still match on it.
    pub fn with_context(
        self,
        table: impl Into<String>,
        phase: impl Into<String>,
        batch: Option<usize>,
    ) -> Self {
        if matches!(self, MigrateError::Cancelled) {
            return self;
        }
        MigrateError::Context {
            table: table.into(),
            phase: phase.into(),
            batch,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context wrappers.
    pub fn root(&self) -> &MigrateError {
        match self {
            MigrateError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this failure is worth retrying for an idempotent operation.
    pub fn is_transient(&self) -> bool {
        match self.root() {
            MigrateError::Transient(_) | MigrateError::Timeout { .. } | MigrateError::Pool { .. } => {
                true
            }
            MigrateError::Postgres(e) => {
                if e.is_closed() {
                    return true;
                }
                // 40001 serialization_failure, 40P01 deadlock_detected, 08xxx connection
                e.code()
                    .map(|c| {
                        let code = c.code();
                        code == "40001" || code == "40P01" || code.starts_with("08")
                    })
                    .unwrap_or(false)
            }
            MigrateError::Mssql(e) => match e {
                tiberius::error::Error::Io { .. } => true,
                tiberius::error::Error::Server(token) => {
                    // 1205 deadlock victim, the rest are Azure SQL throttling/failover
                    matches!(token.code(), 1205 | 4060 | 40197 | 40501 | 40613)
                }
                _ => false,
            },
            #[cfg(feature = "mysql")]
            MigrateError::MySql(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            MigrateError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether this error represents a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), MigrateError::Cancelled)
    }

    /// Exit code the CLI should report for this error.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            MigrateError::Config(_) | MigrateError::Yaml(_) => exit_codes::CONFIG,
            MigrateError::Connection { .. } | MigrateError::Pool { .. } => exit_codes::CONNECTION,
            MigrateError::Manifest(_) | MigrateError::Decode(_) | MigrateError::Json(_) => {
                exit_codes::DATA
            }
            MigrateError::Transfer { .. }
            | MigrateError::ObjectExists(_)
            | MigrateError::ConstraintViolation(_)
            | MigrateError::SchemaExtraction(_) => exit_codes::TRANSFER,
            MigrateError::Validation(_) => exit_codes::VALIDATION,
            MigrateError::Cancelled => exit_codes::CANCELLED,
            MigrateError::Io(_) => exit_codes::IO,
            _ => exit_codes::OTHER,
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

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
