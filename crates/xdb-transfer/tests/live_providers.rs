//! Write and read round trips against live databases.
//!
//! Each test runs only when its connection variable is set and is skipped
//! otherwise:
//!
//! ```text
//! XDB_TEST_PG_URL="host=localhost user=postgres password=postgres dbname=xdb" \
//! XDB_TEST_MSSQL_URL="Server=tcp:localhost,1433;User Id=sa;Password=...;Database=xdb" \
//!     cargo test -p xdb-transfer --test live_providers
//! ```
//!
//! `XDB_TEST_SSL_MODE` overrides the TLS mode (default `disable`). Tables are
//! created under the `xdb_live` schema with a unique suffix and left in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use xdb_transfer::core::ProviderSettings;
use xdb_transfer::{
    Column, LogicalType, MigrateError, Provider, ProviderKind, ReadOptions, Row, SqlValue, Table,
};

async fn connect(var: &str, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
    let url = match std::env::var(var) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("skipping: {} is not set", var);
            return None;
        }
    };
    let settings = ProviderSettings {
        ssl_mode: std::env::var("XDB_TEST_SSL_MODE").unwrap_or_else(|_| "disable".to_string()),
        ..ProviderSettings::default()
    };
    Some(kind.connect(&url, &settings).await.expect("connect"))
}

fn unique(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}_{}", prefix, nanos)
}

/// One column per logical type. PostgreSQL has no one-byte integer, so
/// `TinyInt` is only included where it reads back unchanged.
fn every_type(name: &str, with_tiny: bool) -> Table {
    let mut t = Table::new("xdb_live", name);
    let mut columns = vec![
        Column::new("id", LogicalType::Int, 1).not_null(),
        Column::new("flag", LogicalType::Boolean, 2),
        Column::new("small", LogicalType::SmallInt, 3),
        Column::new("big", LogicalType::BigInt, 4),
        Column::new("ratio", LogicalType::Real, 5),
        Column::new("measure", LogicalType::Double, 6),
        Column::new("amount", LogicalType::Decimal { precision: 12, scale: 2 }, 7),
        Column::new("label", LogicalType::varchar(40), 8),
        Column::new("blob", LogicalType::Binary { max_length: None }, 9),
        Column::new("day", LogicalType::Date, 10),
        Column::new("at", LogicalType::Time, 11),
        Column::new("stamp", LogicalType::DateTime, 12),
        Column::new("zoned", LogicalType::DateTimeOffset, 13),
        Column::new("ref", LogicalType::Guid, 14),
    ];
    if with_tiny {
        columns.push(Column::new("tiny", LogicalType::TinyInt, 15));
    }
    t.columns = columns;
    t.primary_key = Some(vec!["id".into()]);
    t
}

fn sample_rows(with_tiny: bool) -> Vec<Row> {
    let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    let at = NaiveTime::from_hms_micro_opt(23, 59, 58, 123_456).unwrap();
    let mut full = vec![
        SqlValue::I32(1),
        SqlValue::Bool(true),
        SqlValue::I16(-32_000),
        SqlValue::I64(9_007_199_254_740_993),
        SqlValue::F32(1.5),
        SqlValue::F64(-2.25),
        SqlValue::Decimal(Decimal::new(-123_456, 2)),
        SqlValue::from("naïve 'quoted' text"),
        SqlValue::Bytes(vec![0x00, 0x5c, 0xff]),
        SqlValue::Date(day),
        SqlValue::Time(at),
        SqlValue::DateTime(day.and_time(at)),
        SqlValue::DateTimeOffset(
            chrono::DateTime::parse_from_rfc3339("2024-02-29T23:59:58.123456Z").unwrap(),
        ),
        SqlValue::Guid(uuid::Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap()),
    ];
    let mut empty = vec![SqlValue::I32(2)];
    empty.extend(std::iter::repeat(SqlValue::Null).take(full.len() - 1));
    if with_tiny {
        full.push(SqlValue::U8(200));
        empty.push(SqlValue::Null);
    }
    vec![full, empty]
}

async fn read_all(provider: &dyn Provider, table: &Table) -> Vec<Row> {
    let mut rx = provider.read_table(ReadOptions::for_table(table, 1000));
    let mut rows = Vec::new();
    while let Some(batch) = rx.recv().await {
        let batch = batch.expect("read batch");
        rows.extend(batch.rows);
        if batch.is_last {
            break;
        }
    }
    rows
}

fn names(table: &Table) -> Vec<String> {
    table.columns.iter().map(|c| c.name.clone()).collect()
}

async fn round_trip_every_type(provider: Arc<dyn Provider>, with_tiny: bool) {
    let table = every_type(&unique("types"), with_tiny);
    provider.create_table(&table).await.expect("create table");

    let rows = sample_rows(with_tiny);
    let written = provider
        .write_batch(&table, &names(&table), rows.clone(), false, &CancellationToken::new())
        .await
        .expect("write batch");
    assert_eq!(written, 2);
    assert_eq!(read_all(provider.as_ref(), &table).await, rows);
}

/// A failed batch must leave nothing open: a second connection sees the
/// next batch committed without waiting on locks.
async fn failed_batch_leaves_no_transaction(writer: Arc<dyn Provider>, observer: Arc<dyn Provider>) {
    let table = every_type(&unique("atomic"), false);
    writer.create_table(&table).await.expect("create table");
    let columns = names(&table);
    let mut duplicate = sample_rows(false);
    duplicate[1][0] = SqlValue::I32(1);

    let err = writer
        .write_batch(&table, &columns, duplicate, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::ConstraintViolation(_)), "{}", err);

    writer
        .write_batch(&table, &columns, sample_rows(false), false, &CancellationToken::new())
        .await
        .expect("write after failure");
    let count = tokio::time::timeout(
        Duration::from_secs(10),
        observer.get_row_count(&table.schema, &table.name),
    )
    .await
    .expect("count blocked on an open transaction")
    .expect("count");
    assert_eq!(count, 2);
}

async fn cancelled_batch_commits_nothing(provider: Arc<dyn Provider>) {
    let table = every_type(&unique("cancel"), false);
    provider.create_table(&table).await.expect("create table");
    let token = CancellationToken::new();
    token.cancel();

    let err = provider
        .write_batch(&table, &names(&table), sample_rows(false), false, &token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(
        provider.get_row_count(&table.schema, &table.name).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_postgres_round_trips_every_type() {
    let Some(pg) = connect("XDB_TEST_PG_URL", ProviderKind::PostgreSql).await else {
        return;
    };
    round_trip_every_type(pg, false).await;
}

#[tokio::test]
async fn test_postgres_failed_batch_is_rolled_back() {
    let Some(writer) = connect("XDB_TEST_PG_URL", ProviderKind::PostgreSql).await else {
        return;
    };
    let Some(observer) = connect("XDB_TEST_PG_URL", ProviderKind::PostgreSql).await else {
        return;
    };
    failed_batch_leaves_no_transaction(writer, observer).await;
}

#[tokio::test]
async fn test_postgres_cancelled_batch_commits_nothing() {
    let Some(pg) = connect("XDB_TEST_PG_URL", ProviderKind::PostgreSql).await else {
        return;
    };
    cancelled_batch_commits_nothing(pg).await;
}

#[tokio::test]
async fn test_mssql_round_trips_every_type() {
    let Some(mssql) = connect("XDB_TEST_MSSQL_URL", ProviderKind::SqlServer).await else {
        return;
    };
    round_trip_every_type(mssql, true).await;
}

#[tokio::test]
async fn test_mssql_failed_batch_is_rolled_back() {
    let Some(writer) = connect("XDB_TEST_MSSQL_URL", ProviderKind::SqlServer).await else {
        return;
    };
    let Some(observer) = connect("XDB_TEST_MSSQL_URL", ProviderKind::SqlServer).await else {
        return;
    };
    failed_batch_leaves_no_transaction(writer, observer).await;
}

#[tokio::test]
async fn test_mssql_cancelled_batch_commits_nothing() {
    let Some(mssql) = connect("XDB_TEST_MSSQL_URL", ProviderKind::SqlServer).await else {
        return;
    };
    cancelled_batch_commits_nothing(mssql).await;
}

#[tokio::test]
async fn test_mssql_identity_insert_is_scoped_to_batch() {
    let Some(mssql) = connect("XDB_TEST_MSSQL_URL", ProviderKind::SqlServer).await else {
        return;
    };
    let mut table = Table::new("xdb_live", unique("identity"));
    table.columns = vec![
        Column::new("id", LogicalType::Int, 1).identity(),
        Column::new("name", LogicalType::varchar(20), 2).not_null(),
    ];
    table.primary_key = Some(vec!["id".into()]);
    mssql.create_table(&table).await.expect("create table");

    let explicit = vec![vec![SqlValue::I32(10), SqlValue::from("ten")]];
    mssql
        .write_batch(&table, &names(&table), explicit, true, &CancellationToken::new())
        .await
        .expect("explicit identity");
    mssql
        .write_batch(
            &table,
            &["name".to_string()],
            vec![vec![SqlValue::from("next")]],
            false,
            &CancellationToken::new(),
        )
        .await
        .expect("generated identity");

    let rows = read_all(mssql.as_ref(), &table).await;
    assert_eq!(rows[0][0], SqlValue::I32(10));
    assert_eq!(rows[1][0], SqlValue::I32(11));
}
