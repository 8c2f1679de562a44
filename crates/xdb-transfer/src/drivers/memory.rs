//! In-process provider.
//!
//! Holds tables and rows in memory and enforces the constraints a real
//! engine would: duplicate CREATE, primary-key uniqueness, NOT NULL, foreign
//! keys once they are added, and identity columns that refuse explicit
//! values unless identity insert is on. Each `write_batch` is atomic.
//!
//! Faults can be injected per table to exercise retry and
//! continue-on-error paths, and a commit delay holds each batch open so
//! cancellation can land while it is in flight.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DialectImpl, MssqlDialect};
use crate::core::schema::{ForeignKey, Index, Table};
use crate::core::traits::{table_matches, Dialect, Provider, ReadOptions};
use crate::core::value::{Batch, Row, SqlValue};
use crate::error::{MigrateError, Result};
use crate::logging::{tracing_sink, LogSink, SharedSink};

/// Kind of failure an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retryable; surfaces as `MigrateError::Transient`.
    Transient,
    /// Not retryable; surfaces as `MigrateError::Transfer`.
    Permanent,
}

#[derive(Debug, Clone)]
struct Fault {
    kind: FaultKind,
    remaining: usize,
}

/// Rows validated against the current table state, not yet visible.
struct StagedWrite {
    rows: Vec<Row>,
    identity_floor: i64,
    identity_on: Option<String>,
    identity_off: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredTable {
    table: Table,
    rows: Vec<Row>,
    next_identity: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, StoredTable>,
    write_faults: HashMap<String, Fault>,
    read_faults: HashMap<String, Fault>,
    commit_delay: Option<Duration>,
    events: Vec<String>,
}

pub struct MemoryProvider {
    dialect: DialectImpl,
    state: Mutex<MemoryState>,
    closed: AtomicBool,
    log: SharedSink,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Empty database speaking the SQL Server dialect (default schema `dbo`).
    pub fn new() -> Self {
        Self::with_dialect(DialectImpl::Mssql(MssqlDialect::new()))
    }

    pub fn with_dialect(dialect: DialectImpl) -> Self {
        Self {
            dialect,
            state: Mutex::new(MemoryState::default()),
            closed: AtomicBool::new(false),
            log: tracing_sink(),
        }
    }

    pub fn with_logger(mut self, log: SharedSink) -> Self {
        self.log = log;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a table with its rows, indexes and foreign keys as-is,
    /// without constraint checks. Used to set up a source database.
    pub fn seed_table(&self, table: Table, rows: Vec<Row>) {
        let next_identity = next_identity_after(&table, &rows, 1);
        self.state().tables.insert(
            table.full_name(),
            StoredTable {
                table,
                rows,
                next_identity,
            },
        );
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, full_name: &str) -> Option<Vec<Row>> {
        self.state().tables.get(full_name).map(|t| t.rows.clone())
    }

    pub fn row_count(&self, full_name: &str) -> Option<usize> {
        self.state().tables.get(full_name).map(|t| t.rows.len())
    }

    /// Current definition, including the indexes and foreign keys added so far.
    pub fn table(&self, full_name: &str) -> Option<Table> {
        self.state().tables.get(full_name).map(|t| t.table.clone())
    }

    /// DDL and identity-insert statements in the order they were applied.
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    /// Fail the next `count` writes to `table`.
    pub fn inject_write_fault(&self, full_name: &str, kind: FaultKind, count: usize) {
        self.state().write_faults.insert(
            full_name.to_string(),
            Fault {
                kind,
                remaining: count,
            },
        );
    }

    /// Fail the next `count` reads of `table`. Transient faults surface
    /// after two batches have been delivered, as a dropped stream would.
    pub fn inject_read_fault(&self, full_name: &str, kind: FaultKind, count: usize) {
        self.state().read_faults.insert(
            full_name.to_string(),
            Fault {
                kind,
                remaining: count,
            },
        );
    }

    /// Hold every write open for `delay` between validation and commit.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.state().commit_delay = Some(delay);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn missing(full_name: &str) -> MigrateError {
        MigrateError::SchemaExtraction(format!("table {} does not exist", full_name))
    }

    /// Validate a batch against the table as it stands: column mapping,
    /// identity handling, NOT NULL, primary key and foreign keys.
    fn stage(
        &self,
        state: &MemoryState,
        full: &str,
        columns: &[String],
        rows: Vec<Row>,
        identity_insert: bool,
    ) -> Result<StagedWrite> {
        let stored = state.tables.get(full).ok_or_else(|| Self::missing(full))?;
        let def = &stored.table;
        let given = positions(def, columns)?;
        let identity_pos = def.columns.iter().position(|c| c.is_identity);
        let mut next_identity = stored.next_identity;

        let mut staged: Vec<Row> = Vec::with_capacity(rows.len());
        for input in rows {
            if input.len() != columns.len() {
                return Err(MigrateError::transfer(
                    full,
                    format!("row has {} values for {} columns", input.len(), columns.len()),
                ));
            }
            let mut row = vec![SqlValue::Null; def.columns.len()];
            for (value, &pos) in input.into_iter().zip(&given) {
                row[pos] = value;
            }
            if let Some(id) = identity_pos {
                if given.contains(&id) && !row[id].is_null() {
                    if !identity_insert {
                        return Err(MigrateError::ConstraintViolation(format!(
                            "{}: cannot insert explicit value for identity column '{}' when IDENTITY_INSERT is OFF",
                            full, def.columns[id].name
                        )));
                    }
                } else {
                    row[id] = SqlValue::I64(next_identity);
                    next_identity += 1;
                }
            }
            for (col, value) in def.columns.iter().zip(&row) {
                if value.is_null() && !col.is_nullable {
                    return Err(MigrateError::ConstraintViolation(format!(
                        "{}: NULL in NOT NULL column '{}'",
                        full, col.name
                    )));
                }
            }
            staged.push(row);
        }

        if let Some(pk) = def.primary_key.as_ref().filter(|pk| !pk.is_empty()) {
            let pk_pos = positions(def, pk)?;
            let mut seen: HashSet<Vec<String>> = stored
                .rows
                .iter()
                .filter_map(|r| key_of(r, &pk_pos))
                .collect();
            for row in &staged {
                if let Some(key) = key_of(row, &pk_pos) {
                    if !seen.insert(key.clone()) {
                        return Err(MigrateError::ConstraintViolation(format!(
                            "{}: duplicate primary key ({})",
                            full,
                            key.join(", ")
                        )));
                    }
                }
            }
        }

        for fk in &def.foreign_keys {
            let parent_name = fk.ref_full_name();
            let parent = state
                .tables
                .get(&parent_name)
                .ok_or_else(|| Self::missing(&parent_name))?;
            let pending: &[Row] = if parent_name == full { &staged } else { &[] };
            check_references(fk, def, &staged, parent, pending)?;
        }

        let toggle = identity_insert && identity_pos.is_some();
        Ok(StagedWrite {
            rows: staged,
            identity_floor: next_identity,
            identity_on: toggle
                .then(|| self.dialect.identity_insert_sql(def, true))
                .flatten(),
            identity_off: toggle
                .then(|| self.dialect.identity_insert_sql(def, false))
                .flatten(),
        })
    }

    /// Filtered, ordered and projected copy of a table's rows.
    fn snapshot(&self, full: &str, opts: &ReadOptions) -> Result<Vec<Row>> {
        let state = self.state();
        let stored = state.tables.get(full).ok_or_else(|| Self::missing(full))?;
        let projection = positions(&stored.table, &opts.column_names())?;
        let order = positions(&stored.table, &opts.order_by)?;
        let filter = match opts.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            Some(f) => Some(SimpleFilter::parse(f, &stored.table)?),
            None => None,
        };
        let mut rows: Vec<&Row> = stored
            .rows
            .iter()
            .filter(|r| filter.as_ref().map_or(true, |f| f.matches(r)))
            .collect();
        rows.sort_by(|a, b| {
            order
                .iter()
                .map(|&i| compare_values(&a[i], &b[i]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        Ok(rows
            .into_iter()
            .map(|r| projection.iter().map(|&i| r[i].clone()).collect())
            .collect())
    }
}

/// Consume one pending fault for `full`, if any.
fn take_fault(faults: &mut HashMap<String, Fault>, full: &str) -> Option<FaultKind> {
    let fault = faults.get_mut(full)?;
    if fault.remaining == 0 {
        return None;
    }
    fault.remaining -= 1;
    Some(fault.kind)
}

/// One past the largest identity value present.
fn next_identity_after(table: &Table, rows: &[Row], floor: i64) -> i64 {
    let Some(idx) = table.columns.iter().position(|c| c.is_identity) else {
        return floor;
    };
    rows.iter()
        .filter_map(|r| r.get(idx).and_then(SqlValue::as_i64))
        .map(|v| v + 1)
        .fold(floor, i64::max)
}

fn key_of(row: &Row, positions: &[usize]) -> Option<Vec<String>> {
    positions
        .iter()
        .map(|&i| match &row[i] {
            SqlValue::Null => None,
            v => Some(v.key_repr()),
        })
        .collect()
}

fn positions(table: &Table, columns: &[String]) -> Result<Vec<usize>> {
    columns
        .iter()
        .map(|name| {
            table
                .columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| {
                    MigrateError::transfer(
                        table.full_name(),
                        format!("unknown column '{}'", name),
                    )
                })
        })
        .collect()
}

/// Rows of `parent` referenced by `fk` are present for every child key.
fn check_references(
    fk: &ForeignKey,
    child: &Table,
    child_rows: &[Row],
    parent: &StoredTable,
    pending_parent_rows: &[Row],
) -> Result<()> {
    let child_pos = positions(child, &fk.columns)?;
    let parent_pos = positions(&parent.table, &fk.ref_columns)?;
    let parent_keys: HashSet<Vec<String>> = parent
        .rows
        .iter()
        .chain(pending_parent_rows)
        .filter_map(|r| key_of(r, &parent_pos))
        .collect();
    for row in child_rows {
        if let Some(key) = key_of(row, &child_pos) {
            if !parent_keys.contains(&key) {
                return Err(MigrateError::ConstraintViolation(format!(
                    "{}: {} references missing {} ({})",
                    child.full_name(),
                    fk.name,
                    fk.ref_full_name(),
                    key.join(", ")
                )));
            }
        }
    }
    Ok(())
}

/// Ordering used for ORDER BY: integers numerically, NULL first.
fn compare_values(a: &SqlValue, b: &SqlValue) -> Ordering {
    match (a, b) {
        (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
        (SqlValue::Null, _) => Ordering::Less,
        (_, SqlValue::Null) => Ordering::Greater,
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (a, b) {
                (SqlValue::F64(x), SqlValue::F64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
                (SqlValue::Decimal(x), SqlValue::Decimal(y)) => x.cmp(y),
                (SqlValue::DateTime(x), SqlValue::DateTime(y)) => x.cmp(y),
                _ => a.key_repr().cmp(&b.key_repr()),
            },
        },
    }
}

/// Minimal predicate support: `column <op> literal`, where the literal is an
/// integer or a single-quoted string.
#[derive(Debug)]
struct SimpleFilter {
    column: usize,
    op: String,
    literal: SqlValue,
}

impl SimpleFilter {
    fn parse(filter: &str, table: &Table) -> Result<Self> {
        let unsupported =
            || MigrateError::Validation(format!("memory provider cannot evaluate filter '{}'", filter));
        let ops = ["<=", ">=", "<>", "!=", "=", "<", ">"];
        let (pos, op) = ops
            .iter()
            .filter_map(|op| filter.find(op).map(|p| (p, *op)))
            .min_by_key(|(p, _)| *p)
            .ok_or_else(unsupported)?;
        let column = filter[..pos]
            .trim()
            .trim_matches(|c| matches!(c, '[' | ']' | '"' | '`'));
        let raw = filter[pos + op.len()..].trim();
        let literal = if let Some(s) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
            SqlValue::String(s.replace("''", "'"))
        } else {
            raw.parse::<i64>().map(SqlValue::I64).map_err(|_| unsupported())?
        };
        let column = table
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(unsupported)?;
        Ok(Self {
            column,
            op: op.to_string(),
            literal,
        })
    }

    fn matches(&self, row: &Row) -> bool {
        let value = &row[self.column];
        if value.is_null() {
            return false;
        }
        let ord = compare_values(value, &self.literal);
        match self.op.as_str() {
            "=" => ord == Ordering::Equal,
            "<>" | "!=" => ord != Ordering::Equal,
            "<" => ord == Ordering::Less,
            "<=" => ord != Ordering::Greater,
            ">" => ord == Ordering::Greater,
            _ => ord != Ordering::Less,
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn get_tables(&self, filter: Option<&[String]>) -> Result<Vec<Table>> {
        let state = self.state();
        Ok(state
            .tables
            .values()
            .map(|t| t.table.clone())
            .filter(|t| filter.map_or(true, |f| table_matches(t, f)))
            .collect())
    }

    async fn get_row_count(&self, schema: &str, table: &str) -> Result<u64> {
        let full = format!("{}.{}", schema, table);
        self.row_count(&full)
            .map(|n| n as u64)
            .ok_or_else(|| Self::missing(&full))
    }

    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(4);
        let full = format!("{}.{}", opts.schema, opts.table);

        let fault = take_fault(&mut self.state().read_faults, &full);
        let snapshot = match fault {
            Some(FaultKind::Permanent) => Err(MigrateError::transfer(&full, "injected read failure")),
            _ => self.snapshot(&full, &opts),
        };

        let batch_size = opts.batch_size.max(1);
        tokio::spawn(async move {
            let rows = match snapshot {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            let mut iter = rows.into_iter();
            let mut sent = 0usize;
            loop {
                let chunk: Vec<Row> = iter.by_ref().take(batch_size).collect();
                let last = chunk.len() < batch_size;
                if fault == Some(FaultKind::Transient) && (sent >= 2 || last) {
                    let err = MigrateError::Transient(format!("injected read failure on {}", full));
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                if last {
                    let _ = tx.send(Ok(Batch::new(chunk).mark_final())).await;
                    return;
                }
                if tx.send(Ok(Batch::new(chunk))).await.is_err() {
                    return;
                }
                sent += 1;
            }
        });
        rx
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .state()
            .tables
            .contains_key(&format!("{}.{}", schema, table)))
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        table.validate()?;
        let full = table.full_name();
        let mut state = self.state();
        if state.tables.contains_key(&full) {
            return Err(MigrateError::ObjectExists(full));
        }
        let mut created = table.clone();
        created.indexes.clear();
        created.foreign_keys.clear();
        state.events.push(format!("CREATE TABLE {}", full));
        state.tables.insert(
            full,
            StoredTable {
                table: created,
                rows: Vec::new(),
                next_identity: 1,
            },
        );
        Ok(())
    }

    async fn create_index(&self, table: &Table, index: &Index) -> Result<()> {
        let full = table.full_name();
        let mut state = self.state();
        let stored = state.tables.get_mut(&full).ok_or_else(|| Self::missing(&full))?;
        if stored.table.indexes.iter().any(|i| i.name == index.name) {
            return Err(MigrateError::ObjectExists(index.name.clone()));
        }
        positions(&stored.table, &index.columns)?;
        stored.table.indexes.push(index.clone());
        state.events.push(format!("CREATE INDEX {} ON {}", index.name, full));
        Ok(())
    }

    async fn create_foreign_key(&self, table: &Table, fk: &ForeignKey) -> Result<()> {
        let full = table.full_name();
        let mut state = self.state();
        let parent = state
            .tables
            .get(&fk.ref_full_name())
            .cloned()
            .ok_or_else(|| {
                MigrateError::ConstraintViolation(format!(
                    "{}: {} references missing table {}",
                    full,
                    fk.name,
                    fk.ref_full_name()
                ))
            })?;
        let stored = state.tables.get_mut(&full).ok_or_else(|| Self::missing(&full))?;
        if stored.table.foreign_keys.iter().any(|f| f.name == fk.name) {
            return Err(MigrateError::ObjectExists(fk.name.clone()));
        }
        check_references(fk, &stored.table, &stored.rows, &parent, &[])?;
        stored.table.foreign_keys.push(fk.clone());
        state
            .events
            .push(format!("ADD CONSTRAINT {} ON {}", fk.name, full));
        Ok(())
    }

    async fn write_batch(
        &self,
        table: &Table,
        columns: &[String],
        rows: Vec<Row>,
        identity_insert: bool,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let full = table.full_name();
        let (staged, delay) = {
            let mut state = self.state();
            match take_fault(&mut state.write_faults, &full) {
                Some(FaultKind::Transient) => {
                    return Err(MigrateError::Transient(format!(
                        "injected write failure on {}",
                        full
                    )))
                }
                Some(FaultKind::Permanent) => {
                    return Err(MigrateError::transfer(&full, "injected write failure"))
                }
                None => {}
            }
            if rows.is_empty() {
                return Ok(0);
            }
            (
                self.stage(&state, &full, columns, rows, identity_insert)?,
                state.commit_delay,
            )
        };

        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            self.state().events.push(format!("ROLLBACK {}", full));
            self.log
                .warn(&format!("memory: rolled back batch for {} on cancellation", full));
            return Err(MigrateError::Cancelled);
        }

        let written = staged.rows.len() as u64;
        let mut state = self.state();
        if let Some(sql) = staged.identity_on {
            state.events.push(sql);
        }
        let stored = state.tables.get_mut(&full).ok_or_else(|| Self::missing(&full))?;
        stored.next_identity = next_identity_after(&stored.table, &staged.rows, staged.identity_floor);
        stored.rows.extend(staged.rows);
        if let Some(sql) = staged.identity_off {
            state.events.push(sql);
        }
        drop(state);

        self.log
            .debug(&format!("memory: wrote {} rows to {}", written, full));
        Ok(written)
    }

    async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MigrateError::connection("memory", "connection is closed"));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{Column, FkAction, LogicalType};
    use std::sync::Arc;

    fn parents() -> Table {
        let mut t = Table::new("dbo", "Parents");
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).identity(),
            Column::new("Name", LogicalType::varchar(50), 2).not_null(),
        ];
        t.primary_key = Some(vec!["Id".into()]);
        t
    }

    fn children() -> Table {
        let mut t = Table::new("dbo", "Children");
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).not_null(),
            Column::new("ParentId", LogicalType::Int, 2),
        ];
        t.primary_key = Some(vec!["Id".into()]);
        t.foreign_keys = vec![ForeignKey {
            name: "FK_Children_Parents".into(),
            columns: vec!["ParentId".into()],
            ref_schema: "dbo".into(),
            ref_table: "Parents".into(),
            ref_columns: vec!["Id".into()],
            on_delete: FkAction::NoAction,
            on_update: FkAction::NoAction,
        }];
        t
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    async fn drain(rx: &mut mpsc::Receiver<Result<Batch>>) -> (usize, Option<MigrateError>) {
        let mut rows = 0;
        while let Some(batch) = rx.recv().await {
            match batch {
                Ok(batch) => {
                    rows += batch.len();
                    if batch.is_last {
                        break;
                    }
                }
                Err(e) => return (rows, Some(e)),
            }
        }
        (rows, None)
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let db = MemoryProvider::new();
        db.create_table(&parents()).await.unwrap();
        let err = db.create_table(&parents()).await.unwrap_err();
        assert!(matches!(err, MigrateError::ObjectExists(_)));
    }

    #[tokio::test]
    async fn test_identity_requires_identity_insert() {
        let db = MemoryProvider::new();
        let t = parents();
        db.create_table(&t).await.unwrap();
        let row = vec![SqlValue::I32(7), SqlValue::from("a")];

        let err = db
            .write_batch(&t, &cols(&["Id", "Name"]), vec![row.clone()], false, &token())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ConstraintViolation(_)));

        db.write_batch(&t, &cols(&["Id", "Name"]), vec![row], true, &token())
            .await
            .unwrap();
        let events = db.events();
        assert_eq!(events[1], "SET IDENTITY_INSERT [dbo].[Parents] ON");
        assert_eq!(events[2], "SET IDENTITY_INSERT [dbo].[Parents] OFF");

        // Generated values continue after the explicit one.
        db.write_batch(&t, &cols(&["Name"]), vec![vec![SqlValue::from("b")]], false, &token())
            .await
            .unwrap();
        let rows = db.rows("dbo.Parents").unwrap();
        assert_eq!(rows[1][0], SqlValue::I64(8));
    }

    #[tokio::test]
    async fn test_batch_is_atomic_on_pk_violation() {
        let db = MemoryProvider::new();
        let t = children();
        let mut t_no_fk = t.clone();
        t_no_fk.foreign_keys.clear();
        db.create_table(&t_no_fk).await.unwrap();
        let rows = vec![
            vec![SqlValue::I32(1), SqlValue::Null],
            vec![SqlValue::I32(1), SqlValue::Null],
        ];
        let err = db
            .write_batch(&t_no_fk, &cols(&["Id", "ParentId"]), rows, false, &token())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ConstraintViolation(_)));
        assert_eq!(db.row_count("dbo.Children"), Some(0));
    }

    #[tokio::test]
    async fn test_foreign_key_enforced_after_creation() {
        let db = MemoryProvider::new();
        let p = parents();
        let c = children();
        db.create_table(&p).await.unwrap();
        db.create_table(&c).await.unwrap();
        db.write_batch(&p, &cols(&["Name"]), vec![vec![SqlValue::from("a")]], false, &token())
            .await
            .unwrap();
        db.create_foreign_key(&c, &c.foreign_keys[0]).await.unwrap();

        db.write_batch(
            &c,
            &cols(&["Id", "ParentId"]),
            vec![vec![SqlValue::I32(1), SqlValue::I32(1)]],
            false,
            &token(),
        )
        .await
        .unwrap();
        let err = db
            .write_batch(
                &c,
                &cols(&["Id", "ParentId"]),
                vec![vec![SqlValue::I32(2), SqlValue::I32(99)]],
                false,
                &token(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_read_table_batches_and_filter() {
        let db = MemoryProvider::new();
        let t = parents();
        let rows = (1..=5)
            .rev()
            .map(|i| vec![SqlValue::I32(i), SqlValue::from(format!("n{}", i))])
            .collect();
        db.seed_table(t.clone(), rows);

        let mut rx = db.read_table(ReadOptions::for_table(&t, 2));
        let mut sizes = Vec::new();
        let mut first = None;
        while let Some(batch) = rx.recv().await {
            let batch = batch.unwrap();
            if first.is_none() {
                first = batch.rows.first().cloned();
            }
            sizes.push(batch.len());
            if batch.is_last {
                break;
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(first.unwrap()[0], SqlValue::I32(1));

        let opts = ReadOptions::for_table(&t, 10).with_filter(Some("[Id] >= 4".into()));
        let batch = db.read_table(opts).recv().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.is_last);
    }

    #[tokio::test]
    async fn test_injected_write_fault_is_consumed() {
        let db = MemoryProvider::new();
        let t = parents();
        db.create_table(&t).await.unwrap();
        db.inject_write_fault("dbo.Parents", FaultKind::Transient, 1);
        let batch = vec![vec![SqlValue::from("a")]];
        let err = db
            .write_batch(&t, &cols(&["Name"]), batch.clone(), false, &token())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        db.write_batch(&t, &cols(&["Name"]), batch, false, &token()).await.unwrap();
        assert_eq!(db.row_count("dbo.Parents"), Some(1));
    }

    #[tokio::test]
    async fn test_cancel_during_commit_delay_rolls_back() {
        let db = Arc::new(MemoryProvider::new());
        let t = parents();
        db.create_table(&t).await.unwrap();
        db.write_batch(&t, &cols(&["Name"]), vec![vec![SqlValue::from("kept")]], false, &token())
            .await
            .unwrap();
        db.set_commit_delay(Duration::from_secs(30));

        let cancel = token();
        let writer = {
            let db = db.clone();
            let t = t.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let rows = (0..50).map(|i| vec![SqlValue::from(format!("n{}", i))]).collect();
                db.write_batch(&t, &cols(&["Name"]), rows, false, &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = writer.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(db.row_count("dbo.Parents"), Some(1));
        assert_eq!(db.events().last().unwrap(), "ROLLBACK dbo.Parents");

        // Generated identities are not consumed by the rolled-back batch.
        db.set_commit_delay(Duration::ZERO);
        db.write_batch(&t, &cols(&["Name"]), vec![vec![SqlValue::from("next")]], false, &token())
            .await
            .unwrap();
        assert_eq!(db.rows("dbo.Parents").unwrap()[1][0], SqlValue::I64(2));
    }

    #[tokio::test]
    async fn test_read_faults_by_kind() {
        let db = MemoryProvider::new();
        let t = parents();
        let rows = (1..=5)
            .map(|i| vec![SqlValue::I32(i), SqlValue::from(format!("n{}", i))])
            .collect();
        db.seed_table(t.clone(), rows);

        db.inject_read_fault("dbo.Parents", FaultKind::Transient, 1);
        let (delivered, err) = drain(&mut db.read_table(ReadOptions::for_table(&t, 2))).await;
        assert_eq!(delivered, 4);
        assert!(err.unwrap().is_transient());
        let (delivered, err) = drain(&mut db.read_table(ReadOptions::for_table(&t, 2))).await;
        assert_eq!(delivered, 5);
        assert!(err.is_none());

        db.inject_read_fault("dbo.Parents", FaultKind::Permanent, 1);
        let (delivered, err) = drain(&mut db.read_table(ReadOptions::for_table(&t, 2))).await;
        assert_eq!(delivered, 0);
        assert!(!err.unwrap().is_transient());
    }

    #[tokio::test]
    async fn test_close_marks_closed() {
        let db = MemoryProvider::new();
        db.ping().await.unwrap();
        db.close().await;
        assert!(db.is_closed());
        assert!(db.ping().await.is_err());
    }
}
