//! SQL Server provider.
//!
//! Tiberius over a single-connection bb8 pool. The pool re-validates the
//! session on checkout so a dropped connection is re-established between
//! batches instead of failing the rest of the run.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::NaiveTime;
use futures::StreamExt;
use tiberius::{Client, Config, Query, ToSql};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;

use super::dialect::MssqlDialect;
use crate::core::schema::{Column, FkAction, ForeignKey, Index, LogicalType, Table};
use crate::core::traits::{table_matches, Dialect, Provider, ProviderSettings, ReadOptions};
use crate::core::value::{Batch, Row, SqlValue};
use crate::drivers::common::SslMode;
use crate::error::{MigrateError, Result};
use crate::logging::{LogSink, SharedSink};

/// Maximum TDS packet size (32767 bytes, ~32KB).
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection acquisition timeout from pool (30 seconds).
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keepalive interval (30 seconds).
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// SQL Server accepts at most 2100 parameters per request.
const MAX_PARAMS: usize = 2000;

/// SQL Server caps a VALUES list at 1000 rows.
const MAX_ROWS_PER_INSERT: usize = 1000;

type MssqlConn = PooledConnection<'static, TiberiusConnectionManager>;

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: Config,
}

impl TiberiusConnectionManager {
    /// Build from an ADO.NET style connection string
    /// (`Server=tcp:host,1433;Database=...;User Id=...;Password=...`).
    pub fn from_ado_string(connection_string: &str, ssl_mode: SslMode) -> Result<Self> {
        let mut config = Config::from_ado_string(connection_string)
            .map_err(|e| MigrateError::connection("mssql", e))?;
        config.encryption(ssl_mode.mssql_encryption());
        if ssl_mode.requires_tls() && !ssl_mode.verifies_certificate() {
            config.trust_cert();
        }
        config.packet_size(TDS_MAX_PACKET_SIZE);
        Ok(Self { config })
    }
}

fn io_error(e: std::io::Error) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: e.to_string(),
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(io_error)?;
        tcp.set_nodelay(true).ok();

        let std_tcp = tcp.into_std().map_err(io_error)?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            tracing::warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }
        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(io_error)?;

        Client::connect(config, tcp.compat_write()).await
    }

    /// Rejects sessions left inside a transaction, such as one whose write
    /// was dropped by a timeout. Discarding the session makes the server roll
    /// the transaction back and clears any identity-insert setting with it.
    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        let open = conn
            .simple_query("SELECT @@TRANCOUNT")
            .await?
            .into_row()
            .await?
            .and_then(|r| r.get::<i32, _>(0))
            .unwrap_or(0);
        if open > 0 {
            return Err(tiberius::error::Error::Protocol(
                format!("session has {} open transaction(s)", open).into(),
            ));
        }
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub struct MssqlProvider {
    pool: Pool<TiberiusConnectionManager>,
    dialect: MssqlDialect,
    log: SharedSink,
}

impl MssqlProvider {
    pub async fn connect(connection_string: &str, settings: &ProviderSettings) -> Result<Self> {
        let ssl_mode = SslMode::parse(&settings.ssl_mode)?;
        if !ssl_mode.requires_tls() {
            settings
                .log
                .warn("TLS is disabled; credentials are sent in plaintext");
        }
        let manager = TiberiusConnectionManager::from_ado_string(connection_string, ssl_mode)?;
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| MigrateError::connection("mssql", e))?;

        let provider = Self {
            pool,
            dialect: MssqlDialect::new(),
            log: settings.log.clone(),
        };
        provider
            .ping()
            .await
            .map_err(|e| MigrateError::connection("mssql", e))?;
        provider.log.info("Connected to SQL Server");
        Ok(provider)
    }

    async fn conn(&self, context: &str) -> Result<MssqlConn> {
        self.pool
            .get_owned()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }

    async fn load_columns(&self, client: &mut MssqlConn, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                COLUMN_NAME,
                DATA_TYPE,
                CAST(ISNULL(CHARACTER_MAXIMUM_LENGTH, 0) AS INT),
                CAST(ISNULL(NUMERIC_PRECISION, 0) AS INT),
                CAST(ISNULL(NUMERIC_SCALE, 0) AS INT),
                CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END,
                ISNULL(COLUMNPROPERTY(OBJECT_ID(QUOTENAME(TABLE_SCHEMA) + '.' + QUOTENAME(TABLE_NAME)), COLUMN_NAME, 'IsIdentity'), 0),
                ORDINAL_POSITION,
                COLUMN_DEFAULT
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());
        let rows = query.query(&mut **client).await?.into_first_result().await?;

        for row in rows {
            let native = row.get::<&str, _>(1).unwrap_or_default().to_string();
            let mut precision = row.get::<i32, _>(3).unwrap_or(0);
            let mut scale = row.get::<i32, _>(4).unwrap_or(0);
            // money and smallmoney report their precision but read as decimal(19,4).
            if matches!(native.as_str(), "money" | "smallmoney") {
                precision = 19;
                scale = 4;
            }
            table.columns.push(Column {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                logical_type: self.dialect.logical_type(
                    &native,
                    row.get::<i32, _>(2).unwrap_or(0),
                    precision,
                    scale,
                ),
                native_type: native,
                is_nullable: row.get::<i32, _>(5).unwrap_or(0) == 1,
                is_identity: row.get::<i32, _>(6).unwrap_or(0) == 1,
                ordinal: row.get::<i32, _>(7).unwrap_or(0).max(0) as u32,
                default_value: row.get::<&str, _>(8).map(String::from),
            });
        }
        Ok(())
    }

    async fn load_primary_key(&self, client: &mut MssqlConn, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());
        let rows = query.query(&mut **client).await?.into_first_result().await?;

        let pk: Vec<String> = rows
            .iter()
            .map(|row| row.get::<&str, _>(0).unwrap_or_default().to_string())
            .collect();
        table.primary_key = (!pk.is_empty()).then_some(pk);
        Ok(())
    }

    async fn load_indexes(&self, client: &mut MssqlConn, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                i.name AS index_name,
                i.is_unique,
                STUFF((
                    SELECT ',' + c2.name
                    FROM sys.index_columns ic2
                    JOIN sys.columns c2 ON ic2.object_id = c2.object_id AND ic2.column_id = c2.column_id
                    WHERE ic2.object_id = i.object_id AND ic2.index_id = i.index_id AND ic2.is_included_column = 0
                    ORDER BY ic2.key_ordinal
                    FOR XML PATH('')
                ), 1, 1, '') AS columns
            FROM sys.indexes i
            JOIN sys.tables tb ON i.object_id = tb.object_id
            JOIN sys.schemas s ON tb.schema_id = s.schema_id
            WHERE s.name = @P1
              AND tb.name = @P2
              AND i.is_primary_key = 0
              AND i.is_unique_constraint = 0
              AND i.type > 0
            ORDER BY i.name
        "#;

        let mut q = Query::new(query);
        q.bind(table.schema.as_str());
        q.bind(table.name.as_str());
        let rows = q.query(&mut **client).await?.into_first_result().await?;

        for row in rows {
            table.indexes.push(Index {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                is_unique: row.get::<bool, _>(1).unwrap_or(false),
                columns: split_list(row.get::<&str, _>(2).unwrap_or_default()),
            });
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, client: &mut MssqlConn, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                fk.name AS fk_name,
                STUFF((
                    SELECT ',' + pc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns pc2 ON fkc2.parent_object_id = pc2.object_id AND fkc2.parent_column_id = pc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS parent_columns,
                rs.name AS ref_schema,
                rt.name AS ref_table,
                STUFF((
                    SELECT ',' + rc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns rc2 ON fkc2.referenced_object_id = rc2.object_id AND fkc2.referenced_column_id = rc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS ref_columns,
                fk.delete_referential_action_desc,
                fk.update_referential_action_desc
            FROM sys.foreign_keys fk
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            JOIN sys.schemas rs ON rt.schema_id = rs.schema_id
            WHERE ps.name = @P1 AND pt.name = @P2
            ORDER BY fk.name
        "#;

        let mut q = Query::new(query);
        q.bind(table.schema.as_str());
        q.bind(table.name.as_str());
        let rows = q.query(&mut **client).await?.into_first_result().await?;

        for row in rows {
            table.foreign_keys.push(ForeignKey {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                columns: split_list(row.get::<&str, _>(1).unwrap_or_default()),
                ref_schema: row.get::<&str, _>(2).unwrap_or_default().to_string(),
                ref_table: row.get::<&str, _>(3).unwrap_or_default().to_string(),
                ref_columns: split_list(row.get::<&str, _>(4).unwrap_or_default()),
                on_delete: FkAction::parse(row.get::<&str, _>(5).unwrap_or_default()),
                on_update: FkAction::parse(row.get::<&str, _>(6).unwrap_or_default()),
            });
        }
        Ok(())
    }

    async fn execute_ddl(&self, sql: &str, object: &str, context: &str) -> Result<()> {
        let mut conn = self.conn(context).await?;
        conn.execute(sql, &[])
            .await
            .map_err(|e| classify(e, object))?;
        Ok(())
    }
}

#[async_trait]
impl Provider for MssqlProvider {
    fn name(&self) -> &str {
        "mssql"
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn get_tables(&self, filter: Option<&[String]>) -> Result<Vec<Table>> {
        let mut client = self.conn("listing tables").await?;
        let query = r#"
            SELECT t.TABLE_SCHEMA, t.TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES t
            WHERE t.TABLE_TYPE = 'BASE TABLE'
              AND t.TABLE_NAME NOT IN ('sysdiagrams')
            ORDER BY t.TABLE_SCHEMA, t.TABLE_NAME
        "#;
        let rows = client
            .simple_query(query)
            .await?
            .into_first_result()
            .await?;

        let mut tables = Vec::new();
        for row in rows {
            let mut table = Table::new(
                row.get::<&str, _>(0).unwrap_or_default(),
                row.get::<&str, _>(1).unwrap_or_default(),
            );
            if let Some(filter) = filter {
                if !table_matches(&table, filter) {
                    continue;
                }
            }
            tables.push(table);
        }

        for table in tables.iter_mut() {
            self.load_columns(&mut client, table).await?;
            self.load_primary_key(&mut client, table).await?;
            self.load_indexes(&mut client, table).await?;
            self.load_foreign_keys(&mut client, table).await?;
            self.log.debug(&format!(
                "Loaded {}: {} columns, {} indexes, {} foreign keys",
                table.full_name(),
                table.columns.len(),
                table.indexes.len(),
                table.foreign_keys.len()
            ));
        }
        Ok(tables)
    }

    async fn get_row_count(&self, schema: &str, table: &str) -> Result<u64> {
        let mut client = self.conn("counting rows").await?;
        let sql = count_sql(&self.dialect, schema, table);
        let row = client.simple_query(sql).await?.into_row().await?;
        Ok(row
            .and_then(|r| r.get::<i64, _>(0))
            .unwrap_or(0)
            .max(0) as u64)
    }

    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(4);
        let pool = self.pool.clone();
        let sql = select_with_casts(&self.dialect, &opts);

        tokio::spawn(async move {
            if let Err(e) = stream_rows(pool, sql, opts, tx.clone()).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let mut client = self.conn("checking table existence").await?;
        let mut q = Query::new(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2",
        );
        q.bind(schema);
        q.bind(table);
        let row = q.query(&mut *client).await?.into_row().await?;
        Ok(row.and_then(|r| r.get::<i32, _>(0)).unwrap_or(0) > 0)
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        if table.schema != self.dialect.default_schema() {
            let sql = format!(
                "IF SCHEMA_ID(N'{0}') IS NULL EXEC('CREATE SCHEMA {1}')",
                table.schema.replace('\'', "''"),
                self.dialect.quote_ident(&table.schema).replace('\'', "''")
            );
            self.execute_ddl(&sql, &table.schema, "creating schema").await?;
        }
        self.execute_ddl(
            &self.dialect.create_table_sql(table),
            &table.full_name(),
            "creating table",
        )
        .await
    }

    async fn create_index(&self, table: &Table, index: &Index) -> Result<()> {
        self.execute_ddl(
            &self.dialect.create_index_sql(table, index),
            &index.name,
            "creating index",
        )
        .await
    }

    async fn create_foreign_key(&self, table: &Table, fk: &ForeignKey) -> Result<()> {
        self.execute_ddl(
            &self.dialect.add_foreign_key_sql(table, fk),
            &fk.name,
            "creating foreign key",
        )
        .await
    }

    async fn write_batch(
        &self,
        table: &Table,
        columns: &[String],
        rows: Vec<Row>,
        identity_insert: bool,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if columns.is_empty() {
            return Err(MigrateError::transfer(
                table.full_name(),
                "Cannot insert with zero columns",
            ));
        }
        let identity = if identity_insert && table.has_identity() {
            self.dialect
                .identity_insert_sql(table, true)
                .zip(self.dialect.identity_insert_sql(table, false))
        } else {
            None
        };
        let (on, off) = match &identity {
            Some((on, off)) => (Some(on.as_str()), Some(off.as_str())),
            None => (None, None),
        };

        let mut conn = self.conn("writing batch").await?;
        let outcome = async {
            run_batch(&mut conn, &begin_batch_sql(on)).await?;
            let written =
                insert_rows(&mut conn, &self.dialect, table, columns, &rows, cancel).await?;
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            run_batch(&mut conn, &commit_batch_sql(off)).await?;
            Ok::<_, MigrateError>(written)
        }
        .await;

        match outcome {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(undo) = run_batch(&mut conn, &abort_batch_sql(off)).await {
                    // The pool rejects the session on next checkout if it is still in a transaction.
                    self.log.warn(&format!(
                        "Rollback failed for {}: {}",
                        table.full_name(),
                        undo
                    ));
                } else if e.is_cancelled() {
                    self.log.warn(&format!(
                        "{}: batch rolled back on cancellation",
                        table.full_name()
                    ));
                }
                Err(e)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn("ping").await?;
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    async fn close(&self) {
        self.log.debug("Closing SQL Server connection");
    }
}

/// Execute session-level statements as a plain SQL batch. Parameterized
/// requests run inside `sp_executesql`, which would scope `SET` options and
/// transaction state to that call.
async fn run_batch(conn: &mut MssqlConn, sql: &str) -> Result<()> {
    conn.simple_query(sql).await?.into_results().await?;
    Ok(())
}

fn begin_batch_sql(identity_on: Option<&str>) -> String {
    match identity_on {
        Some(on) => format!("BEGIN TRANSACTION; {};", on),
        None => "BEGIN TRANSACTION;".to_string(),
    }
}

fn commit_batch_sql(identity_off: Option<&str>) -> String {
    match identity_off {
        Some(off) => format!("{}; COMMIT TRANSACTION;", off),
        None => "COMMIT TRANSACTION;".to_string(),
    }
}

/// Undo a failed batch. Identity insert is a session setting that a
/// rollback does not reset, so it is switched off explicitly.
fn abort_batch_sql(identity_off: Option<&str>) -> String {
    match identity_off {
        Some(off) => format!("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION; {};", off),
        None => "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;".to_string(),
    }
}

fn count_sql(dialect: &MssqlDialect, schema: &str, table: &str) -> String {
    format!("SELECT COUNT_BIG(*) FROM {}", dialect.qualify(schema, table))
}

/// Insert in statements of at most [`MAX_ROWS_PER_INSERT`] rows. Cancellation
/// is observed between statements; a statement in flight runs to completion
/// so the session stays usable for the rollback.
async fn insert_rows(
    conn: &mut MssqlConn,
    dialect: &MssqlDialect,
    table: &Table,
    columns: &[String],
    rows: &[Row],
    cancel: &CancellationToken,
) -> Result<u64> {
    let rows_per_stmt = (MAX_PARAMS / columns.len()).clamp(1, MAX_ROWS_PER_INSERT);
    let mut written = 0u64;
    for chunk in rows.chunks(rows_per_stmt) {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        let sql = dialect.insert_sql(table, columns, chunk.len());
        let params = insert_params(chunk);
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let result = conn
            .execute(sql.as_str(), &param_refs)
            .await
            .map_err(|e| classify(e, &table.full_name()))?;
        written += result.total();
    }
    Ok(written)
}

fn insert_params(rows: &[Row]) -> Vec<Box<dyn ToSql>> {
    rows.iter()
        .flat_map(|row| row.iter().map(sql_value_to_sql_param))
        .collect()
}

/// Map server error numbers onto engine errors.
fn classify(e: tiberius::error::Error, object: &str) -> MigrateError {
    if let tiberius::error::Error::Server(token) = &e {
        match token.code() {
            // There is already an object named ... / index already exists.
            2714 | 1913 => return MigrateError::ObjectExists(object.to_string()),
            // Unique, PK, FK/check and NOT NULL violations.
            2627 | 2601 | 547 | 515 => {
                return MigrateError::ConstraintViolation(format!("{}: {}", object, token.message()))
            }
            _ => {}
        }
    }
    MigrateError::Mssql(e)
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// SELECT list that converts types tiberius cannot decode into ones it can.
fn select_with_casts(dialect: &MssqlDialect, opts: &ReadOptions) -> String {
    let mut cast_opts = opts.clone();
    cast_opts.columns.clear();
    let base = dialect.select_sql(&cast_opts);
    let exprs: Vec<String> = opts.columns.iter().map(|c| select_expr(dialect, c)).collect();
    if exprs.is_empty() {
        return base;
    }
    base.replacen("SELECT *", &format!("SELECT {}", exprs.join(", ")), 1)
}

fn select_expr(dialect: &MssqlDialect, col: &Column) -> String {
    let q = dialect.quote_ident(&col.name);
    match (col.native_type.to_lowercase().as_str(), &col.logical_type) {
        ("money" | "smallmoney", _) => format!("CAST({} AS decimal(19,4)) AS {}", q, q),
        ("geography" | "geometry" | "hierarchyid", _) => format!("{}.ToString() AS {}", q, q),
        (_, LogicalType::Other { .. }) => format!("CAST({} AS nvarchar(max)) AS {}", q, q),
        _ => q,
    }
}

fn sql_value_to_sql_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null => Box::new(Option::<String>::None),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::U8(n) => Box::new(*n),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::String(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Guid(u) => Box::new(*u),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(d.and_time(NaiveTime::MIN)),
        SqlValue::Time(t) => Box::new(*t),
    }
}

async fn stream_rows(
    pool: Pool<TiberiusConnectionManager>,
    sql: String,
    opts: ReadOptions,
    tx: mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let mut conn = pool
        .get_owned()
        .await
        .map_err(|e| MigrateError::pool(e, "reading table"))?;
    let mut stream = conn.query(sql.as_str(), &[]).await?.into_row_stream();

    let mut rows = Vec::with_capacity(opts.batch_size);
    while let Some(row) = stream.next().await {
        rows.push(convert_row(&row?, &opts.columns)?);
        if rows.len() >= opts.batch_size {
            let full = std::mem::replace(&mut rows, Vec::with_capacity(opts.batch_size));
            if tx.send(Ok(Batch::new(full))).await.is_err() {
                return Ok(());
            }
        }
    }
    let _ = tx.send(Ok(Batch::new(rows).mark_final())).await;
    Ok(())
}

fn convert_row(row: &tiberius::Row, columns: &[Column]) -> Result<Row> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, col)| convert_row_value(row, idx, &col.logical_type))
        .collect()
}

fn convert_row_value(row: &tiberius::Row, idx: usize, ty: &LogicalType) -> Result<SqlValue> {
    let value = match ty {
        LogicalType::Boolean => row.try_get::<bool, _>(idx)?.map(SqlValue::Bool),
        LogicalType::TinyInt => row.try_get::<u8, _>(idx)?.map(SqlValue::U8),
        LogicalType::SmallInt => row.try_get::<i16, _>(idx)?.map(SqlValue::I16),
        LogicalType::Int => row.try_get::<i32, _>(idx)?.map(SqlValue::I32),
        LogicalType::BigInt => row.try_get::<i64, _>(idx)?.map(SqlValue::I64),
        LogicalType::Real => row.try_get::<f32, _>(idx)?.map(SqlValue::F32),
        LogicalType::Double => row.try_get::<f64, _>(idx)?.map(SqlValue::F64),
        LogicalType::Decimal { .. } => row
            .try_get::<rust_decimal::Decimal, _>(idx)?
            .map(SqlValue::Decimal),
        LogicalType::String { .. } | LogicalType::Other { .. } => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::String(s.to_string())),
        LogicalType::Binary { .. } => row
            .try_get::<&[u8], _>(idx)?
            .map(|b| SqlValue::Bytes(b.to_vec())),
        LogicalType::Date => row.try_get::<chrono::NaiveDate, _>(idx)?.map(SqlValue::Date),
        LogicalType::Time => row.try_get::<chrono::NaiveTime, _>(idx)?.map(SqlValue::Time),
        LogicalType::DateTime => row
            .try_get::<chrono::NaiveDateTime, _>(idx)?
            .map(SqlValue::DateTime),
        LogicalType::DateTimeOffset => row
            .try_get::<chrono::DateTime<chrono::FixedOffset>, _>(idx)?
            .map(SqlValue::DateTimeOffset),
        LogicalType::Guid => row.try_get::<uuid::Uuid, _>(idx)?.map(SqlValue::Guid),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assets() -> Table {
        let mut t = Table::new("dbo", "Assets");
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).identity(),
            Column {
                native_type: "money".into(),
                ..Column::new(
                    "Price",
                    LogicalType::Decimal {
                        precision: 19,
                        scale: 4,
                    },
                    2,
                )
            },
            Column {
                native_type: "geography".into(),
                ..Column::new("Location", LogicalType::Other { name: "geography".into() }, 3)
            },
            Column {
                native_type: "xml".into(),
                ..Column::new("Payload", LogicalType::Other { name: "xml".into() }, 4)
            },
        ];
        t.primary_key = Some(vec!["Id".into()]);
        t
    }

    #[test]
    fn test_select_with_casts() {
        let sql = select_with_casts(&MssqlDialect::new(), &ReadOptions::for_table(&assets(), 100));
        assert_eq!(
            sql,
            "SELECT [Id], CAST([Price] AS decimal(19,4)) AS [Price], [Location].ToString() AS [Location], \
             CAST([Payload] AS nvarchar(max)) AS [Payload] FROM [dbo].[Assets] WITH (NOLOCK) ORDER BY [Id]"
        );
    }

    #[test]
    fn test_select_with_filter() {
        let opts = ReadOptions::for_table(&assets(), 100).with_filter(Some("[Id] > 10".into()));
        let sql = select_with_casts(&MssqlDialect::new(), &opts);
        assert!(sql.ends_with("WITH (NOLOCK) WHERE ([Id] > 10) ORDER BY [Id]"));
    }

    #[test]
    fn test_count_reads_committed() {
        assert_eq!(
            count_sql(&MssqlDialect::new(), "dbo", "Assets"),
            "SELECT COUNT_BIG(*) FROM [dbo].[Assets]"
        );
    }

    #[test]
    fn test_batch_statements_without_identity() {
        assert_eq!(begin_batch_sql(None), "BEGIN TRANSACTION;");
        assert_eq!(commit_batch_sql(None), "COMMIT TRANSACTION;");
        assert_eq!(abort_batch_sql(None), "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;");
    }

    #[test]
    fn test_failed_batch_turns_identity_insert_off() {
        let dialect = MssqlDialect::new();
        let table = assets();
        let on = dialect.identity_insert_sql(&table, true).unwrap();
        let off = dialect.identity_insert_sql(&table, false).unwrap();
        assert_eq!(
            begin_batch_sql(Some(&on)),
            "BEGIN TRANSACTION; SET IDENTITY_INSERT [dbo].[Assets] ON;"
        );
        assert_eq!(
            commit_batch_sql(Some(&off)),
            "SET IDENTITY_INSERT [dbo].[Assets] OFF; COMMIT TRANSACTION;"
        );
        let abort = abort_batch_sql(Some(&off));
        assert_eq!(
            abort,
            "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION; SET IDENTITY_INSERT [dbo].[Assets] OFF;"
        );
        assert!(abort.find("ROLLBACK") < abort.find("IDENTITY_INSERT"));
    }

    #[test]
    fn test_params_per_value_kind() {
        use tiberius::ColumnData;

        let day = chrono::NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let zoned = chrono::DateTime::parse_from_rfc3339("2024-05-17T12:00:00-05:00").unwrap();
        let rows = vec![vec![
            SqlValue::Bool(true),
            SqlValue::U8(7),
            SqlValue::I16(-3),
            SqlValue::I32(70_000),
            SqlValue::I64(1 << 40),
            SqlValue::F32(1.5),
            SqlValue::F64(-2.25),
            SqlValue::Decimal(rust_decimal::Decimal::new(12345, 2)),
            SqlValue::from("caf\u{e9}"),
            SqlValue::Bytes(vec![1, 2]),
            SqlValue::Guid(uuid::Uuid::nil()),
            SqlValue::Date(day),
            SqlValue::Time(noon),
            SqlValue::DateTime(day.and_time(noon)),
            SqlValue::DateTimeOffset(zoned),
            SqlValue::Null,
        ]];
        let params = insert_params(&rows);
        let data: Vec<ColumnData<'_>> = params.iter().map(|p| p.to_sql()).collect();
        assert_eq!(data.len(), 16);
        assert!(matches!(data[0], ColumnData::Bit(Some(true))));
        assert!(matches!(data[1], ColumnData::U8(Some(7))));
        assert!(matches!(data[2], ColumnData::I16(Some(-3))));
        assert!(matches!(data[3], ColumnData::I32(Some(70_000))));
        assert!(matches!(data[4], ColumnData::I64(Some(v)) if v == 1 << 40));
        assert!(matches!(data[5], ColumnData::F32(Some(v)) if v == 1.5));
        assert!(matches!(data[6], ColumnData::F64(Some(v)) if v == -2.25));
        assert!(matches!(data[7], ColumnData::Numeric(Some(n)) if n.value() == 12345 && n.scale() == 2));
        assert!(matches!(&data[8], ColumnData::String(Some(s)) if s == "caf\u{e9}"));
        assert!(matches!(&data[9], ColumnData::Binary(Some(b)) if b.as_ref() == [1u8, 2]));
        assert!(matches!(data[10], ColumnData::Guid(Some(g)) if g.is_nil()));
        // Dates bind as datetime2 at midnight; the server converts on assignment.
        assert!(matches!(data[11], ColumnData::DateTime2(Some(_))));
        assert!(matches!(data[12], ColumnData::Time(Some(_))));
        assert!(matches!(data[13], ColumnData::DateTime2(Some(_))));
        assert!(matches!(data[14], ColumnData::DateTimeOffset(Some(_))));
        assert!(matches!(data[15], ColumnData::String(None)));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a,b"), vec!["a".to_string(), "b".to_string()]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_ado_string_parses() {
        let mgr = TiberiusConnectionManager::from_ado_string(
            "Server=tcp:localhost,1433;Database=shop;User Id=sa;Password=secret",
            SslMode::Disable,
        )
        .unwrap();
        assert_eq!(mgr.config.get_addr(), "localhost:1433");
    }
}
