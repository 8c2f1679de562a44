//! Provider capability contract.
//!
//! The export and import engines only ever talk to a database through
//! [`Provider`]. Each provider couples a live connection with a [`Dialect`]
//! that knows how to spell DDL and queries for its engine.
//!
//! - [`Provider`]: metadata discovery, row streaming, DDL and batch writes
//! - [`Dialect`]: SQL syntax and type mapping strategy
//! - [`ProviderSettings`]: construction-time options, including the log sink

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::logging::{tracing_sink, SharedSink};

use super::schema::{Column, ForeignKey, Index, LogicalType, Table};
use super::value::{Batch, Row};

/// Options for streaming rows out of a table.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub schema: String,
    pub table: String,
    /// Columns to read, in output order. Types drive value conversion.
    pub columns: Vec<Column>,
    /// Ordering columns, normally the primary key.
    pub order_by: Vec<String>,
    /// Rows per emitted [`Batch`].
    pub batch_size: usize,
    /// Optional row filter, already validated as a SQL fragment.
    pub filter: Option<String>,
}

impl ReadOptions {
    /// Read every column of `table` ordered by its primary key.
    pub fn for_table(table: &Table, batch_size: usize) -> Self {
        Self {
            schema: table.schema.clone(),
            table: table.name.clone(),
            columns: table.columns.clone(),
            order_by: table.primary_key.clone().unwrap_or_default(),
            batch_size: batch_size.max(1),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Options a provider receives when it is constructed.
#[derive(Clone)]
pub struct ProviderSettings {
    /// Receives human-readable progress and warning lines.
    pub log: SharedSink,
    /// TLS mode for engines that support it (`disable`, `require`, `verify-full`, ...).
    pub ssl_mode: String,
    /// Schema assumed for bare table names.
    pub default_schema: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            log: tracing_sink(),
            ssl_mode: "require".to_string(),
            default_schema: None,
        }
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("ssl_mode", &self.ssl_mode)
            .field("default_schema", &self.default_schema)
            .finish_non_exhaustive()
    }
}

/// A connected database engine.
///
/// One provider instance owns one logical connection; callers never share an
/// instance across concurrent operations.
///
/// # Streaming
///
/// [`read_table`](Provider::read_table) returns a channel receiver fed by a
/// background task so that large tables are never held in memory at once.
/// The final batch has `is_last` set; an empty table yields one empty final
/// batch.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short engine identifier (`mssql`, `postgres`, `mysql`, `memory`).
    fn name(&self) -> &str;

    /// SQL strategy for this engine.
    fn dialect(&self) -> &dyn Dialect;

    /// Schema used when a table name has no schema part.
    fn default_schema(&self) -> &str {
        self.dialect().default_schema()
    }

    /// Enumerate user tables with columns, primary key, indexes and foreign keys.
    ///
    /// With `filter`, only tables whose `schema.table` or bare name matches an
    /// entry (case-insensitive) are returned.
    async fn get_tables(&self, filter: Option<&[String]>) -> Result<Vec<Table>>;

    /// Exact row count.
    async fn get_row_count(&self, schema: &str, table: &str) -> Result<u64>;

    /// Stream rows in batches of `opts.batch_size`.
    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>>;

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Create the table with columns and primary key only.
    async fn create_table(&self, table: &Table) -> Result<()>;

    async fn create_index(&self, table: &Table, index: &Index) -> Result<()>;

    async fn create_foreign_key(&self, table: &Table, fk: &ForeignKey) -> Result<()>;

    /// Insert `rows` (values ordered as `columns`) in one transaction.
    ///
    /// With `identity_insert`, explicit values are accepted for identity
    /// columns for the duration of the call. When `cancel` fires before the
    /// commit, the transaction is rolled back and
    /// [`MigrateError::Cancelled`](crate::error::MigrateError::Cancelled) is
    /// returned; no row of the batch is visible afterwards.
    async fn write_batch(
        &self,
        table: &Table,
        columns: &[String],
        rows: Vec<Row>,
        identity_insert: bool,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Cheap round trip to verify the connection.
    async fn ping(&self) -> Result<()>;

    /// Release the connection.
    async fn close(&self);
}

/// SQL syntax and type mapping for one engine.
///
/// The DDL builders are template methods: engines override the primitives
/// ([`quote_ident`](Dialect::quote_ident), [`native_type`](Dialect::native_type),
/// [`identity_clause`](Dialect::identity_clause)) and inherit the statement
/// layout.
pub trait Dialect: Send + Sync {
    /// Dialect identifier (e.g., "mssql", "postgres").
    fn name(&self) -> &str;

    fn default_schema(&self) -> &str;

    /// Quote an identifier, escaping embedded quote characters.
    fn quote_ident(&self, name: &str) -> String;

    fn qualify(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    /// Native column type for a logical type.
    fn native_type(&self, ty: &LogicalType) -> String;

    /// Logical type for a native catalog type. Unknown names map to
    /// [`LogicalType::Other`] carrying the original name.
    fn logical_type(&self, native: &str, max_length: i32, precision: i32, scale: i32)
        -> LogicalType;

    /// Column suffix marking an identity column (empty if unsupported).
    fn identity_clause(&self, col: &Column) -> String;

    /// Parameter placeholder for a 1-based index.
    fn param_placeholder(&self, index: usize) -> String;

    /// Column definition used inside CREATE TABLE.
    fn column_definition(&self, col: &Column) -> String {
        let mut def = format!(
            "{} {}",
            self.quote_ident(&col.name),
            self.native_type(&col.logical_type)
        );
        if col.is_identity {
            let clause = self.identity_clause(col);
            if !clause.is_empty() {
                def.push(' ');
                def.push_str(&clause);
            }
        }
        def.push_str(if col.is_nullable { " NULL" } else { " NOT NULL" });
        def
    }

    fn create_table_sql(&self, table: &Table) -> String {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("    {}", self.column_definition(c)))
            .collect();
        if let Some(pk) = table.primary_key.as_ref().filter(|pk| !pk.is_empty()) {
            parts.push(format!(
                "    CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_ident(&format!("PK_{}_{}", table.schema, table.name)),
                self.quote_list(pk)
            ));
        }
        format!(
            "CREATE TABLE {} (\n{}\n)",
            self.qualify(&table.schema, &table.name),
            parts.join(",\n")
        )
    }

    fn create_index_sql(&self, table: &Table, index: &Index) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.is_unique { "UNIQUE " } else { "" },
            self.quote_ident(&index.name),
            self.qualify(&table.schema, &table.name),
            self.quote_list(&index.columns)
        )
    }

    fn add_foreign_key_sql(&self, table: &Table, fk: &ForeignKey) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            self.qualify(&table.schema, &table.name),
            self.quote_ident(&fk.name),
            self.quote_list(&fk.columns),
            self.qualify(&fk.ref_schema, &fk.ref_table),
            self.quote_list(&fk.ref_columns),
            fk.on_delete.as_sql(),
            fk.on_update.as_sql()
        )
    }

    /// Statement toggling explicit identity inserts, when the engine needs one.
    fn identity_insert_sql(&self, _table: &Table, _enable: bool) -> Option<String> {
        None
    }

    fn select_sql(&self, opts: &ReadOptions) -> String {
        let cols = if opts.columns.is_empty() {
            "*".to_string()
        } else {
            self.quote_list(&opts.column_names())
        };
        let mut sql = format!("SELECT {} FROM {}", cols, self.qualify(&opts.schema, &opts.table));
        if let Some(filter) = opts.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            sql.push_str(&format!(" WHERE ({})", filter));
        }
        if !opts.order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.quote_list(&opts.order_by)));
        }
        sql
    }

    fn count_sql(&self, schema: &str, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.qualify(schema, table))
    }

    /// Multi-row INSERT with placeholders for `rows` rows.
    fn insert_sql(&self, table: &Table, columns: &[String], rows: usize) -> String {
        let width = columns.len();
        let values: Vec<String> = (0..rows)
            .map(|r| {
                let ph: Vec<String> = (1..=width)
                    .map(|c| self.param_placeholder(r * width + c))
                    .collect();
                format!("({})", ph.join(", "))
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.qualify(&table.schema, &table.name),
            self.quote_list(columns),
            values.join(", ")
        )
    }

    fn quote_list(&self, names: &[String]) -> String {
        names
            .iter()
            .map(|n| self.quote_ident(n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Whether `table` matches any entry of a table filter.
///
/// Entries are `schema.table` or a bare table name; comparison ignores case.
pub fn table_matches(table: &Table, filter: &[String]) -> bool {
    let full = table.full_name();
    filter.iter().any(|entry| {
        let entry = entry.trim();
        if entry.contains('.') {
            entry.eq_ignore_ascii_case(&full)
        } else {
            entry.eq_ignore_ascii_case(&table.name)
        }
    })
}
