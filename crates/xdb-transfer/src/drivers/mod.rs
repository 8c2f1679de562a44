//! Database driver implementations.
//!
//! - [`mssql`]: Microsoft SQL Server driver
//! - [`postgres`]: PostgreSQL driver
//! - [`mysql`]: MySQL/MariaDB driver (live provider behind the `mysql` feature)
//! - [`firebird`]: Firebird dialect
//! - [`memory`]: in-process provider used by tests and dry runs
//! - [`common`]: Shared utilities (TLS)
//!
//! # Adding New Databases
//!
//! 1. Create a new module under `drivers/` with a `Dialect` implementation
//! 2. Implement `Provider` for the live connection
//! 3. Add a variant to [`ProviderKind`] and [`DialectImpl`]

pub mod common;
pub mod firebird;
pub mod memory;
pub mod mssql;
pub mod mysql;
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use common::{SslMode, TlsBuilder};
pub use firebird::FirebirdDialect;
pub use memory::MemoryProvider;
pub use mssql::{MssqlDialect, MssqlProvider};
pub use mysql::MysqlDialect;
pub use postgres::{PostgresDialect, PostgresProvider};

use crate::core::schema::{Column, LogicalType, Table};
use crate::core::traits::{Dialect, Provider, ProviderSettings, ReadOptions};
use crate::error::{MigrateError, Result};

/// The closed set of supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "mssql", alias = "sqlserver")]
    SqlServer,
    MySql,
    #[serde(rename = "postgres", alias = "postgresql")]
    PostgreSql,
    Firebird,
}

impl ProviderKind {
    /// Parse a provider name; accepts the usual aliases.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mssql" | "sqlserver" | "sql_server" => Ok(ProviderKind::SqlServer),
            "mysql" | "mariadb" => Ok(ProviderKind::MySql),
            "postgres" | "postgresql" | "pg" => Ok(ProviderKind::PostgreSql),
            "firebird" | "fb" => Ok(ProviderKind::Firebird),
            other => Err(MigrateError::Config(format!(
                "Unknown provider: '{}'. Supported providers: mssql, mysql, postgres, firebird",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::SqlServer => "mssql",
            ProviderKind::MySql => "mysql",
            ProviderKind::PostgreSql => "postgres",
            ProviderKind::Firebird => "firebird",
        }
    }

    /// SQL dialect for this engine, available without a connection.
    pub fn dialect(&self) -> DialectImpl {
        match self {
            ProviderKind::SqlServer => DialectImpl::Mssql(MssqlDialect::new()),
            ProviderKind::MySql => DialectImpl::Mysql(MysqlDialect::new()),
            ProviderKind::PostgreSql => DialectImpl::Postgres(PostgresDialect::new()),
            ProviderKind::Firebird => DialectImpl::Firebird(FirebirdDialect::new()),
        }
    }

    /// Open a provider. The returned object is the only thing the engine
    /// sees; it never inspects the concrete kind again.
    pub async fn connect(
        &self,
        connection_string: &str,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn Provider>> {
        if connection_string.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "{} connection string is empty",
                self.as_str()
            )));
        }
        match self {
            ProviderKind::SqlServer => Ok(Arc::new(
                MssqlProvider::connect(connection_string, settings).await?,
            )),
            ProviderKind::PostgreSql => Ok(Arc::new(
                PostgresProvider::connect(connection_string, settings).await?,
            )),
            #[cfg(feature = "mysql")]
            ProviderKind::MySql => Ok(Arc::new(
                mysql::MysqlProvider::connect(connection_string, settings).await?,
            )),
            #[cfg(not(feature = "mysql"))]
            ProviderKind::MySql => Err(MigrateError::Config(
                "MySQL support is not compiled in; rebuild with --features mysql".into(),
            )),
            ProviderKind::Firebird => Err(MigrateError::Config(
                "Firebird has no live driver; it is supported as a script dialect only".into(),
            )),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enum-based static dispatch for dialects.
///
/// Manual impl; the compiler generates a match statement instead of using
/// vtable dispatch.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Mssql(MssqlDialect),
    Postgres(PostgresDialect),
    Mysql(MysqlDialect),
    Firebird(FirebirdDialect),
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $body:expr) => {
        match $self {
            DialectImpl::Mssql($d) => $body,
            DialectImpl::Postgres($d) => $body,
            DialectImpl::Mysql($d) => $body,
            DialectImpl::Firebird($d) => $body,
        }
    };
}

impl Dialect for DialectImpl {
    fn name(&self) -> &str {
        dispatch!(self, d => d.name())
    }

    fn default_schema(&self) -> &str {
        dispatch!(self, d => d.default_schema())
    }

    fn quote_ident(&self, name: &str) -> String {
        dispatch!(self, d => d.quote_ident(name))
    }

    fn qualify(&self, schema: &str, table: &str) -> String {
        dispatch!(self, d => d.qualify(schema, table))
    }

    fn native_type(&self, ty: &LogicalType) -> String {
        dispatch!(self, d => d.native_type(ty))
    }

    fn logical_type(&self, native: &str, max_length: i32, precision: i32, scale: i32) -> LogicalType {
        dispatch!(self, d => d.logical_type(native, max_length, precision, scale))
    }

    fn identity_clause(&self, col: &Column) -> String {
        dispatch!(self, d => d.identity_clause(col))
    }

    fn param_placeholder(&self, index: usize) -> String {
        dispatch!(self, d => d.param_placeholder(index))
    }

    fn identity_insert_sql(&self, table: &Table, enable: bool) -> Option<String> {
        dispatch!(self, d => d.identity_insert_sql(table, enable))
    }

    fn select_sql(&self, opts: &ReadOptions) -> String {
        dispatch!(self, d => d.select_sql(opts))
    }
}
