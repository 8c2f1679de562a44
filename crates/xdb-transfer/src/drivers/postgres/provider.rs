//! PostgreSQL provider.
//!
//! Uses a single-connection deadpool-postgres pool so that reconnects after a
//! dropped session are handled by the pool, while each provider instance still
//! owns exactly one logical connection.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::{pin_mut, StreamExt};
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tokio_util::sync::CancellationToken;

use super::dialect::PostgresDialect;
use crate::core::schema::{Column, FkAction, ForeignKey, Index, LogicalType, Table};
use crate::core::traits::{table_matches, Dialect, Provider, ProviderSettings, ReadOptions};
use crate::core::value::{Batch, Row, SqlValue};
use crate::drivers::common::{SslMode, TlsBuilder};
use crate::error::{MigrateError, Result};
use crate::logging::{LogSink, SharedSink};

/// Connection timeout for establishing a session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL caps bind parameters per statement at 65535.
const MAX_PARAMS: usize = 65_535;

/// Rows per INSERT statement upper bound.
const MAX_ROWS_PER_INSERT: usize = 1000;

pub struct PostgresProvider {
    pool: Pool,
    dialect: PostgresDialect,
    log: SharedSink,
}

impl PostgresProvider {
    /// Connect using a libpq-style connection string (`host=... user=...`) or URL.
    pub async fn connect(connection_string: &str, settings: &ProviderSettings) -> Result<Self> {
        let mut pg_config: PgConfig = connection_string
            .parse()
            .map_err(|e: tokio_postgres::Error| MigrateError::connection("postgres", e))?;
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECT_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let ssl_mode = SslMode::parse(&settings.ssl_mode)?;
        let builder = match TlsBuilder::new(ssl_mode).build(&settings.log)? {
            None => Pool::builder(Manager::from_config(
                pg_config,
                tokio_postgres::NoTls,
                mgr_config,
            )),
            Some(tls) => Pool::builder(Manager::from_config(pg_config, tls, mgr_config)),
        };
        let pool = builder
            .max_size(1)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL pool"))?;

        let provider = Self {
            pool,
            dialect: PostgresDialect::new(),
            log: settings.log.clone(),
        };
        provider
            .ping()
            .await
            .map_err(|e| MigrateError::connection("postgres", e))?;
        provider.log.info("Connected to PostgreSQL");
        Ok(provider)
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }

    async fn load_columns(&self, client: &Object, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                column_name::text,
                udt_name::text,
                COALESCE(character_maximum_length, 0)::int4,
                COALESCE(numeric_precision, 0)::int4,
                COALESCE(numeric_scale, 0)::int4,
                is_nullable::text = 'YES',
                column_default::text,
                is_identity::text = 'YES',
                ordinal_position::int4
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
        "#;
        let rows = client.query(query, &[&table.schema, &table.name]).await?;
        for row in rows {
            let native: String = row.get(1);
            let default: Option<String> = row.get(6);
            let serial = default
                .as_deref()
                .is_some_and(|d| d.starts_with("nextval("));
            let is_identity = row.get::<_, bool>(7) || serial;
            table.columns.push(Column {
                name: row.get(0),
                logical_type: self.dialect.logical_type(
                    &native,
                    row.get(2),
                    row.get(3),
                    row.get(4),
                ),
                native_type: native,
                is_nullable: row.get(5),
                default_value: if is_identity { None } else { default },
                ordinal: row.get::<_, i32>(8) as u32,
                is_identity,
            });
        }
        Ok(())
    }

    async fn load_primary_key(&self, client: &Object, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT a.attname::text
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid
            WHERE n.nspname = $1
              AND t.relname = $2
              AND c.contype = 'p'
              AND a.attnum = ANY(c.conkey)
            ORDER BY array_position(c.conkey, a.attnum)
        "#;
        let rows = client.query(query, &[&table.schema, &table.name]).await?;
        let pk: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
        table.primary_key = (!pk.is_empty()).then_some(pk);
        Ok(())
    }

    async fn load_indexes(&self, client: &Object, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                i.relname::text,
                ix.indisunique,
                array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum))
            FROM pg_catalog.pg_index ix
            JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
            JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = $1
              AND t.relname = $2
              AND NOT ix.indisprimary
            GROUP BY i.relname, ix.indisunique
            ORDER BY i.relname
        "#;
        let rows = client.query(query, &[&table.schema, &table.name]).await?;
        for row in rows {
            table.indexes.push(Index {
                name: row.get(0),
                is_unique: row.get(1),
                columns: row.get(2),
            });
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, client: &Object, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                c.conname::text,
                array_agg(a.attname::text ORDER BY array_position(c.conkey, a.attnum)),
                rn.nspname::text,
                rt.relname::text,
                array_agg(ra.attname::text ORDER BY array_position(c.confkey, ra.attnum)),
                CASE c.confdeltype
                    WHEN 'r' THEN 'RESTRICT'
                    WHEN 'c' THEN 'CASCADE'
                    WHEN 'n' THEN 'SET_NULL'
                    ELSE 'NO_ACTION'
                END,
                CASE c.confupdtype
                    WHEN 'r' THEN 'RESTRICT'
                    WHEN 'c' THEN 'CASCADE'
                    WHEN 'n' THEN 'SET_NULL'
                    ELSE 'NO_ACTION'
                END
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
            JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
            JOIN LATERAL unnest(c.conkey, c.confkey) AS k(attnum, refnum) ON true
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            JOIN pg_catalog.pg_attribute ra ON ra.attrelid = rt.oid AND ra.attnum = k.refnum
            WHERE n.nspname = $1
              AND t.relname = $2
              AND c.contype = 'f'
            GROUP BY c.conname, rn.nspname, rt.relname, c.confdeltype, c.confupdtype
            ORDER BY c.conname
        "#;
        let rows = client.query(query, &[&table.schema, &table.name]).await?;
        for row in rows {
            table.foreign_keys.push(ForeignKey {
                name: row.get(0),
                columns: row.get(1),
                ref_schema: row.get(2),
                ref_table: row.get(3),
                ref_columns: row.get(4),
                on_delete: FkAction::parse(row.get::<_, &str>(5)),
                on_update: FkAction::parse(row.get::<_, &str>(6)),
            });
        }
        Ok(())
    }

    /// Realign identity sequences after explicit identity values were inserted.
    async fn reset_sequences(
        &self,
        tx: &deadpool_postgres::Transaction<'_>,
        table: &Table,
        columns: &[String],
    ) -> Result<()> {
        let qualified = self.dialect.qualify(&table.schema, &table.name);
        for col in table.columns.iter().filter(|c| c.is_identity) {
            if !columns.contains(&col.name) {
                continue;
            }
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence($1, $2), COALESCE((SELECT MAX({}) FROM {}), 1), true)",
                self.dialect.quote_ident(&col.name),
                qualified
            );
            tx.execute(sql.as_str(), &[&qualified, &col.name]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for PostgresProvider {
    fn name(&self) -> &str {
        "postgres"
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn get_tables(&self, filter: Option<&[String]>) -> Result<Vec<Table>> {
        let client = self.client("listing tables").await?;
        let query = r#"
            SELECT table_schema::text, table_name::text
            FROM information_schema.tables
            WHERE table_type = 'BASE TABLE'
              AND table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY table_schema, table_name
        "#;
        let rows = client.query(query, &[]).await?;

        let mut tables = Vec::new();
        for row in rows {
            let mut table = Table::new(row.get::<_, String>(0), row.get::<_, String>(1));
            if let Some(filter) = filter {
                if !table_matches(&table, filter) {
                    continue;
                }
            }
            self.load_columns(&client, &mut table).await?;
            self.load_primary_key(&client, &mut table).await?;
            self.load_indexes(&client, &mut table).await?;
            self.load_foreign_keys(&client, &mut table).await?;
            self.log.debug(&format!(
                "Loaded {}: {} columns, {} indexes, {} foreign keys",
                table.full_name(),
                table.columns.len(),
                table.indexes.len(),
                table.foreign_keys.len()
            ));
            tables.push(table);
        }
        Ok(tables)
    }

    async fn get_row_count(&self, schema: &str, table: &str) -> Result<u64> {
        let client = self.client("counting rows").await?;
        let row = client
            .query_one(self.dialect.count_sql(schema, table).as_str(), &[])
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(4);
        let pool = self.pool.clone();
        let sql = select_with_text_casts(&self.dialect, &opts);

        tokio::spawn(async move {
            if let Err(e) = stream_rows(pool, sql, opts, tx.clone()).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client("checking table existence").await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
                &[&schema, &table],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let client = self.client("creating table").await?;
        if table.schema != self.dialect.default_schema() {
            let sql = format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                self.dialect.quote_ident(&table.schema)
            );
            client.batch_execute(&sql).await?;
        }
        client
            .batch_execute(&self.dialect.create_table_sql(table))
            .await
            .map_err(|e| classify(e, &table.full_name()))
    }

    async fn create_index(&self, table: &Table, index: &Index) -> Result<()> {
        let client = self.client("creating index").await?;
        client
            .batch_execute(&self.dialect.create_index_sql(table, index))
            .await
            .map_err(|e| classify(e, &index.name))
    }

    async fn create_foreign_key(&self, table: &Table, fk: &ForeignKey) -> Result<()> {
        let client = self.client("creating foreign key").await?;
        client
            .batch_execute(&self.dialect.add_foreign_key_sql(table, fk))
            .await
            .map_err(|e| classify(e, &fk.name))
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
        let casts: Vec<String> = columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|c| bind_cast(&self.dialect, &c.logical_type))
                    .unwrap_or_else(|| "text".to_string())
            })
            .collect();
        let rows_per_stmt = (MAX_PARAMS / columns.len().max(1)).clamp(1, MAX_ROWS_PER_INSERT);

        let mut client = self.client("writing batch").await?;
        let tx = client.transaction().await?;
        let mut written = 0u64;
        for chunk in rows.chunks(rows_per_stmt) {
            let sql = insert_with_casts(&self.dialect, table, columns, &casts, chunk.len());
            let params = insert_params(chunk);
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let executed = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tx.execute(sql.as_str(), &refs) => Some(r),
            };
            match executed {
                Some(r) => written += r.map_err(|e| classify(e, &table.full_name()))?,
                None => break,
            }
        }
        if cancel.is_cancelled() {
            tx.rollback().await?;
            self.log
                .warn(&format!("{}: batch rolled back on cancellation", table.full_name()));
            return Err(MigrateError::Cancelled);
        }
        if identity_insert {
            self.reset_sequences(&tx, table, columns).await?;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("ping").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Map constraint and duplicate-object failures onto engine errors.
fn classify(e: tokio_postgres::Error, object: &str) -> MigrateError {
    match e.code() {
        Some(code) if *code == SqlState::DUPLICATE_TABLE || *code == SqlState::DUPLICATE_OBJECT => {
            MigrateError::ObjectExists(object.to_string())
        }
        Some(code)
            if *code == SqlState::FOREIGN_KEY_VIOLATION
                || *code == SqlState::UNIQUE_VIOLATION
                || *code == SqlState::NOT_NULL_VIOLATION =>
        {
            MigrateError::ConstraintViolation(format!("{}: {}", object, e))
        }
        _ => MigrateError::Postgres(e),
    }
}

/// SELECT list casting unmapped types to text so they read as strings.
fn select_with_text_casts(dialect: &PostgresDialect, opts: &ReadOptions) -> String {
    let cols: Vec<String> = opts
        .columns
        .iter()
        .map(|c| {
            let q = dialect.quote_ident(&c.name);
            match c.logical_type {
                LogicalType::Other { .. } => format!("{}::text AS {}", q, q),
                _ => q,
            }
        })
        .collect();
    let mut sql = format!(
        "SELECT {} FROM {}",
        if cols.is_empty() { "*".to_string() } else { cols.join(", ") },
        dialect.qualify(&opts.schema, &opts.table)
    );
    if let Some(filter) = opts.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        sql.push_str(&format!(" WHERE ({})", filter));
    }
    if !opts.order_by.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", dialect.quote_list(&opts.order_by)));
    }
    sql
}

/// Target type a text parameter is cast to. Character types stay `text` so
/// that an over-long value fails on assignment instead of being truncated by
/// an explicit `varchar(n)` cast.
fn bind_cast(dialect: &PostgresDialect, ty: &LogicalType) -> String {
    match ty {
        LogicalType::String { .. } | LogicalType::Other { .. } => "text".to_string(),
        _ => dialect.native_type(ty),
    }
}

/// INSERT whose placeholders are declared `text` and then converted
/// (`$1::text::integer`), so every value can be bound as a string.
fn insert_with_casts(
    dialect: &PostgresDialect,
    table: &Table,
    columns: &[String],
    casts: &[String],
    rows: usize,
) -> String {
    let width = columns.len();
    let values: Vec<String> = (0..rows)
        .map(|r| {
            let row: Vec<String> = casts
                .iter()
                .enumerate()
                .map(|(c, cast)| {
                    let n = r * width + c + 1;
                    if cast == "text" {
                        format!("${}::text", n)
                    } else {
                        format!("${}::text::{}", n, cast)
                    }
                })
                .collect();
            format!("({})", row.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        dialect.qualify(&table.schema, &table.name),
        dialect.quote_list(columns),
        values.join(", ")
    )
}

/// Row-major text parameters for an INSERT built by [`insert_with_casts`].
fn insert_params(rows: &[Row]) -> Vec<Option<String>> {
    rows.iter().flatten().map(value_to_text).collect()
}

/// Text form of a value, as accepted by PostgreSQL input functions.
fn value_to_text(value: &SqlValue) -> Option<String> {
    Some(match value {
        SqlValue::Null => return None,
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::U8(n) => n.to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(n) => float_text(*n as f64, n.to_string()),
        SqlValue::F64(n) => float_text(*n, n.to_string()),
        SqlValue::Decimal(d) => d.to_string(),
        SqlValue::String(s) => s.clone(),
        SqlValue::Bytes(b) => format!("\\x{}", hex::encode(b)),
        SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        SqlValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        SqlValue::DateTimeOffset(dt) => dt.to_rfc3339(),
        SqlValue::Guid(u) => u.to_string(),
    })
}

fn float_text(v: f64, plain: String) -> String {
    if v.is_nan() {
        "NaN".into()
    } else if v == f64::INFINITY {
        "Infinity".into()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".into()
    } else {
        plain
    }
}

async fn stream_rows(
    pool: Pool,
    sql: String,
    opts: ReadOptions,
    tx: mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, "reading table"))?;
    let stream = client
        .query_raw(sql.as_str(), std::iter::empty::<&dyn ToSql>())
        .await?;
    pin_mut!(stream);

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

fn convert_row(row: &tokio_postgres::Row, columns: &[Column]) -> Result<Row> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, col)| pg_value(row, idx, &col.logical_type))
        .collect()
}

fn pg_value(row: &tokio_postgres::Row, idx: usize, ty: &LogicalType) -> Result<SqlValue> {
    let value = match ty {
        LogicalType::Boolean => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        LogicalType::TinyInt | LogicalType::SmallInt => {
            row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::I16)
        }
        LogicalType::Int => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32),
        LogicalType::BigInt => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        LogicalType::Real => row.try_get::<_, Option<f32>>(idx)?.map(SqlValue::F32),
        LogicalType::Double => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        LogicalType::Decimal { .. } => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(SqlValue::Decimal),
        LogicalType::String { .. } | LogicalType::Other { .. } => {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::String)
        }
        LogicalType::Binary { .. } => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        LogicalType::Date => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(SqlValue::Date),
        LogicalType::Time => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map(SqlValue::Time),
        LogicalType::DateTime => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(SqlValue::DateTime),
        LogicalType::DateTimeOffset => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)?
            .map(SqlValue::DateTimeOffset),
        LogicalType::Guid => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(SqlValue::Guid),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn items() -> Table {
        let mut t = Table::new("public", "items");
        t.columns = vec![
            Column::new("id", LogicalType::Int, 1).not_null(),
            Column::new("payload", LogicalType::Other { name: "jsonb".into() }, 2),
        ];
        t.primary_key = Some(vec!["id".into()]);
        t
    }

    #[test]
    fn test_select_casts_unmapped_types() {
        let sql = select_with_text_casts(&PostgresDialect::new(), &ReadOptions::for_table(&items(), 10));
        assert_eq!(
            sql,
            "SELECT \"id\", \"payload\"::text AS \"payload\" FROM \"public\".\"items\" ORDER BY \"id\""
        );
    }

    fn ledger() -> Table {
        let mut t = Table::new("public", "ledger");
        t.columns = vec![
            Column::new("id", LogicalType::BigInt, 1).not_null(),
            Column::new("active", LogicalType::Boolean, 2),
            Column::new("amount", LogicalType::Decimal { precision: 12, scale: 2 }, 3),
            Column::new("booked_at", LogicalType::DateTime, 4),
            Column::new("zone_at", LogicalType::DateTimeOffset, 5),
            Column::new("blob", LogicalType::Binary { max_length: None }, 6),
            Column::new("ref", LogicalType::Guid, 7),
            Column::new("memo", LogicalType::varchar(40), 8),
        ];
        t.primary_key = Some(vec!["id".into()]);
        t
    }

    #[test]
    fn test_insert_with_casts() {
        let sql = insert_with_casts(
            &PostgresDialect::new(),
            &items(),
            &["id".into(), "payload".into()],
            &["integer".into(), "text".into()],
            2,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"items\" (\"id\", \"payload\") VALUES ($1::text::integer, $2::text), ($3::text::integer, $4::text)"
        );
    }

    #[test]
    fn test_bind_casts_per_logical_type() {
        let dialect = PostgresDialect::new();
        let casts: Vec<String> = ledger()
            .columns
            .iter()
            .map(|c| bind_cast(&dialect, &c.logical_type))
            .collect();
        assert_eq!(
            casts,
            vec![
                "bigint",
                "boolean",
                "numeric(12,2)",
                "timestamp",
                "timestamptz",
                "bytea",
                "uuid",
                "text",
            ]
        );
        assert_eq!(bind_cast(&dialect, &LogicalType::TinyInt), "smallint");
        assert_eq!(bind_cast(&dialect, &LogicalType::Real), "real");
        assert_eq!(bind_cast(&dialect, &LogicalType::Date), "date");
        assert_eq!(bind_cast(&dialect, &LogicalType::Time), "time");
        assert_eq!(
            bind_cast(&dialect, &LogicalType::Other { name: "jsonb".into() }),
            "text"
        );
    }

    #[test]
    fn test_typed_columns_bind_as_text() {
        let table = ledger();
        let dialect = PostgresDialect::new();
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let casts: Vec<String> = table
            .columns
            .iter()
            .map(|c| bind_cast(&dialect, &c.logical_type))
            .collect();
        let sql = insert_with_casts(&dialect, &table, &columns, &casts, 1);
        assert!(sql.ends_with(
            "VALUES ($1::text::bigint, $2::text::boolean, $3::text::numeric(12,2), \
             $4::text::timestamp, $5::text::timestamptz, $6::text::bytea, $7::text::uuid, $8::text)"
        ));

        let booked = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(9, 30, 0, 250)
            .unwrap();
        let zoned = chrono::DateTime::parse_from_rfc3339("2024-03-01T09:30:00+02:00").unwrap();
        let guid = uuid::Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
        let rows = vec![vec![
            SqlValue::I64(42),
            SqlValue::Bool(false),
            SqlValue::Decimal(rust_decimal::Decimal::new(123456, 2)),
            SqlValue::DateTime(booked),
            SqlValue::DateTimeOffset(zoned),
            SqlValue::Bytes(vec![0x00, 0xff]),
            SqlValue::Guid(guid),
            SqlValue::Null,
        ]];
        let params = insert_params(&rows);
        assert_eq!(
            params,
            vec![
                Some("42".to_string()),
                Some("f".to_string()),
                Some("1234.56".to_string()),
                Some("2024-03-01 09:30:00.000250".to_string()),
                Some("2024-03-01T09:30:00+02:00".to_string()),
                Some("\\x00ff".to_string()),
                Some("6f9619ff-8b86-d011-b42d-00c04fc964ff".to_string()),
                None,
            ]
        );
        // Every parameter is a string, which tokio-postgres accepts for `text`.
        assert!(<Option<String> as ToSql>::accepts(&tokio_postgres::types::Type::TEXT));
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&SqlValue::Null), None);
        assert_eq!(value_to_text(&SqlValue::Bool(true)).unwrap(), "t");
        assert_eq!(value_to_text(&SqlValue::Bytes(vec![0xde, 0xad])).unwrap(), "\\xdead");
        assert_eq!(value_to_text(&SqlValue::F64(f64::NAN)).unwrap(), "NaN");
        assert_eq!(
            value_to_text(&SqlValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())).unwrap(),
            "2024-02-29"
        );
    }
}
