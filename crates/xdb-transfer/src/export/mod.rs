//! Exporter: source database to an export directory.
//!
//! Tables are processed one at a time in dependency order. Rows are streamed
//! from the provider and written as they arrive; at most two batches are held
//! in memory. A table that fits in one batch becomes `{schema}_{table}.bin`,
//! anything larger becomes `{schema}_{table}_batch{N}.bin` numbered from 1.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{encode_batch, encode_table_metadata, write_file_atomic, CompressionOptions};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::core::identifier::{file_stem, validate_sql_fragment};
use crate::core::schema::Table;
use crate::core::traits::{table_matches, Provider, ReadOptions};
use crate::core::value::Row;
use crate::error::{MigrateError, Result};
use crate::logging::{tracing_sink, FanoutSink, FileSink, LogSink, SharedSink};
use crate::manifest::{
    batch_file_name, save_dependencies, sha256_hex, single_file_name, DataFile, ExportLayout, ExportManifest,
    ManifestTable,
};
use crate::outcome::{RunStatus, TableOutcome, TableStatus};
use crate::resolver;
use crate::retry::{OperationClass, RetryPolicy};

/// Export settings.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub output_dir: PathBuf,
    /// Tables to export. Empty exports every table.
    pub tables: Vec<String>,
    pub batch_size: usize,
    /// Row filters keyed by `schema.table`, in the source dialect.
    pub filters: BTreeMap<String, String>,
    pub compression: CompressionOptions,
    pub emit_scripts: bool,
    pub emit_table_metadata: bool,
    pub retry: RetryPolicy,
}

impl ExportOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            filters: BTreeMap::new(),
            compression: CompressionOptions::default(),
            emit_scripts: true,
            emit_table_metadata: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of an export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub status: RunStatus,
    pub tables: Vec<TableOutcome>,
    pub total_rows: u64,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Written manifest, absent when the run was cancelled.
    pub manifest_path: Option<PathBuf>,
}

impl ExportResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Drives one provider to produce an export directory.
pub struct Exporter {
    provider: Arc<dyn Provider>,
    options: ExportOptions,
    log: SharedSink,
    cancel: CancellationToken,
}

impl Exporter {
    pub fn new(provider: Arc<dyn Provider>, options: ExportOptions) -> Self {
        Self {
            provider,
            options,
            log: tracing_sink(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_logger(mut self, log: SharedSink) -> Self {
        self.log = log;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run a full export.
    ///
    /// Fails only for run-aborting problems (output directory not writable,
    /// catalog unreadable). Per-table failures are reported in the result.
    pub async fn run(&self) -> Result<ExportResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let layout = ExportLayout::new(&self.options.output_dir);

        layout
            .create_dirs(self.options.emit_scripts, self.options.emit_table_metadata)
            .map_err(|e| {
                MigrateError::Config(format!(
                    "output directory {} is not writable: {}",
                    layout.root().display(),
                    e
                ))
            })?;
        let file_sink: SharedSink = Arc::new(FileSink::create(&layout.export_log())?);
        let log: SharedSink = Arc::new(FanoutSink::new(vec![self.log.clone(), file_sink]));

        for (table, filter) in &self.options.filters {
            validate_sql_fragment(&format!("filter for {}", table), filter)?;
        }

        info!("Phase 1: Reading catalog from {}", self.provider.name());
        log.info(&format!(
            "Export started: provider={}, output={}, batch_size={}",
            self.provider.name(),
            layout.root().display(),
            self.options.batch_size
        ));
        let catalog = self
            .options
            .retry
            .run(OperationClass::Metadata, true, "list tables", || {
                self.provider.get_tables(None)
            })
            .await?;

        let (tables, mut outcomes) = self.select_tables(catalog, &log);
        let resolved = resolver::resolve(&tables);
        let by_name: BTreeMap<String, Table> =
            tables.into_iter().map(|t| (t.full_name(), t)).collect();
        log.info(&format!("Exporting {} tables", by_name.len()));

        info!("Phase 2: Exporting table data");
        let mut manifest = ExportManifest::new(self.provider.name());
        let mut cancelled = false;
        for name in &resolved.order {
            let Some(table) = by_name.get(name) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                cancelled = true;
                outcomes.push(TableOutcome::new(name.clone()));
                continue;
            }

            let table_start = Instant::now();
            let mut outcome = TableOutcome::new(name.clone());
            match self.export_table(table, &layout, &log).await {
                Ok((files, expected)) => {
                    outcome.status = TableStatus::Succeeded;
                    outcome.rows_attempted = expected;
                    outcome.rows_succeeded = files.iter().map(|f| f.rows).sum();
                    outcome.files = files.len();
                    manifest.insert(ManifestTable::exported(table.clone(), files));
                }
                Err(e) if e.is_cancelled() => {
                    cancelled = true;
                    log.warn(&format!("{}: cancelled", name));
                }
                Err(e) => {
                    log.error(&format!("{}: export failed: {}", name, e));
                    manifest.insert(ManifestTable::failed(table.clone(), e.to_string()));
                    outcome = outcome.failed(e);
                }
            }
            outcome.duration_seconds = table_start.elapsed().as_secs_f64();
            outcomes.push(outcome);
        }

        let manifest_path = if cancelled {
            log.warn("Export cancelled; manifest not written");
            None
        } else {
            info!("Phase 3: Writing manifest");
            manifest.finalize();
            let tables: Vec<Table> = manifest
                .dependency_order
                .iter()
                .filter_map(|n| by_name.get(n).cloned())
                .collect();
            if self.options.emit_table_metadata {
                for table in &tables {
                    let path = layout.table_metadata_file(&table.schema, &table.name);
                    write_file_atomic(&path, encode_table_metadata(table)?.as_bytes())?;
                }
            }
            if self.options.emit_scripts {
                self.write_scripts(&layout, &tables)?;
            }
            manifest.validate()?;
            save_dependencies(&layout.dependencies_path(), &manifest.dependency_edges())?;
            manifest.save(&layout.manifest_path())?;
            Some(layout.manifest_path())
        };

        let status = RunStatus::summarize(&outcomes, 0, cancelled);
        let result = ExportResult {
            status,
            total_rows: outcomes.iter().map(|t| t.rows_succeeded).sum(),
            tables: outcomes,
            duration_seconds: start.elapsed().as_secs_f64(),
            started_at,
            completed_at: Utc::now(),
            manifest_path,
        };
        log.info(&format!(
            "Export {}: {} tables, {} rows in {:.1}s",
            result.status.label(),
            result.tables.len(),
            result.total_rows,
            result.duration_seconds
        ));
        Ok(result)
    }

    /// Export one table's data files without touching the manifest.
    pub async fn export_single_table(&self, table: &Table, output_dir: &Path) -> Result<Vec<DataFile>> {
        let layout = ExportLayout::new(output_dir);
        std::fs::create_dir_all(layout.data_dir())?;
        let (files, _) = self.export_table(table, &layout, &self.log).await?;
        Ok(files)
    }

    /// Requested tables plus everything they reference, transitively.
    ///
    /// Requested names that match nothing become failed outcomes. Foreign
    /// keys to tables missing from the catalog are dropped with a warning.
    fn select_tables(&self, catalog: Vec<Table>, log: &SharedSink) -> (Vec<Table>, Vec<TableOutcome>) {
        let mut outcomes = Vec::new();
        let all: BTreeMap<String, Table> =
            catalog.into_iter().map(|t| (t.full_name(), t)).collect();

        let mut queue: VecDeque<String> = if self.options.tables.is_empty() {
            all.keys().cloned().collect()
        } else {
            let mut seeds = VecDeque::new();
            for entry in &self.options.tables {
                let matches: Vec<String> = all
                    .values()
                    .filter(|t| table_matches(t, std::slice::from_ref(entry)))
                    .map(|t| t.full_name())
                    .collect();
                if matches.is_empty() {
                    log.error(&format!("{}: table not found in source", entry));
                    outcomes.push(TableOutcome::new(entry.clone()).failed("table not found in source"));
                }
                seeds.extend(matches);
            }
            seeds
        };

        let mut selected: BTreeSet<String> = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if !selected.insert(name.clone()) {
                continue;
            }
            if let Some(table) = all.get(&name) {
                for dep in table.depends_on() {
                    if all.contains_key(&dep) && !selected.contains(&dep) {
                        if !self.options.tables.is_empty() {
                            log.info(&format!("{} added: referenced by {}", dep, name));
                        }
                        queue.push_back(dep);
                    }
                }
            }
        }

        let tables = selected
            .into_iter()
            .filter_map(|name| all.get(&name).cloned())
            .map(|mut table| {
                let table_name = table.full_name();
                table.foreign_keys.retain(|fk| {
                    let keep = all.contains_key(&fk.ref_full_name());
                    if !keep {
                        log.warn(&format!(
                            "{}: dropping {} (references {} outside the source catalog)",
                            table_name,
                            fk.name,
                            fk.ref_full_name()
                        ));
                    }
                    keep
                });
                table
            })
            .collect();
        (tables, outcomes)
    }

    /// Stream one table into data files. Returns the files and the row
    /// count the source reported.
    async fn export_table(
        &self,
        table: &Table,
        layout: &ExportLayout,
        log: &SharedSink,
    ) -> Result<(Vec<DataFile>, u64)> {
        let name = table.full_name();
        let retry = &self.options.retry;
        let expected = retry
            .run(OperationClass::Metadata, true, "row count", || {
                self.provider.get_row_count(&table.schema, &table.name)
            })
            .await
            .map_err(|e| e.with_context(&name, "row count", None))?;

        let filter = self.options.filters.get(&name).cloned();
        if let Some(f) = &filter {
            log.info(&format!("{}: filter {}", name, f));
        }
        remove_stale_files(layout, table)?;

        let batch_size = self.options.batch_size.max(1);
        let opts = ReadOptions::for_table(table, batch_size).with_filter(filter.clone());
        // Rows come back in the same order on a re-read only when ordered by a key.
        let resumable = table.primary_key.as_ref().is_some_and(|pk| !pk.is_empty());
        let read_timeout = retry.timeout_for(OperationClass::Transfer);

        let mut rx = self.provider.read_table(opts.clone());
        let mut attempt = 0u32;
        let mut skip = 0usize;
        let mut buffer: Vec<Row> = Vec::new();
        let mut files: Vec<DataFile> = Vec::new();
        let mut finished = false;
        while !finished {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                next = tokio::time::timeout(read_timeout, rx.recv()) => next,
            };
            let received = match next {
                Err(_) => Err(MigrateError::Timeout {
                    operation: format!("read {}", name),
                    seconds: read_timeout.as_secs_f64(),
                }),
                Ok(None) => {
                    return Err(MigrateError::transfer(
                        &name,
                        "row stream ended before the final batch",
                    ))
                }
                Ok(Some(received)) => received,
            };
            let batch = match received {
                Ok(batch) => batch,
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.backoff(attempt);
                    attempt += 1;
                    if !resumable {
                        remove_stale_files(layout, table)?;
                        files.clear();
                    }
                    // Resume after the last file written; buffered rows are read again.
                    skip = files.iter().map(|f| f.rows as usize).sum();
                    log.warn(&format!(
                        "{}: read interrupted after {} rows in {} file(s): {}; retry {}/{} in {:?}",
                        name,
                        skip,
                        files.len(),
                        e,
                        attempt,
                        retry.max_retries,
                        delay
                    ));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    buffer.clear();
                    rx = self.provider.read_table(opts.clone());
                    continue;
                }
                Err(e) => return Err(e.with_context(&name, "read", Some(files.len() + 1))),
            };
            finished = batch.is_last;
            let mut rows = batch.rows;
            if skip > 0 {
                let n = skip.min(rows.len());
                rows.drain(..n);
                skip -= n;
            }
            buffer.extend(rows);

            // More rows follow a full chunk, so the table is multi-file.
            while buffer.len() > batch_size {
                let rest = buffer.split_off(batch_size);
                let chunk = std::mem::replace(&mut buffer, rest);
                let file_name = batch_file_name(&table.schema, &table.name, files.len() + 1);
                files.push(self.write_data_file(table, layout, &file_name, &chunk, log)?);
            }
        }

        if files.is_empty() {
            let file_name = single_file_name(&table.schema, &table.name);
            files.push(self.write_data_file(table, layout, &file_name, &buffer, log)?);
        } else if !buffer.is_empty() {
            let file_name = batch_file_name(&table.schema, &table.name, files.len() + 1);
            files.push(self.write_data_file(table, layout, &file_name, &buffer, log)?);
        }

        let streamed: u64 = files.iter().map(|f| f.rows).sum();
        if filter.is_none() && streamed != expected {
            warn!("{}: row count {} but streamed {}", name, expected, streamed);
            log.warn(&format!(
                "{}: source reported {} rows but {} were streamed; using streamed count",
                name, expected, streamed
            ));
        }
        log.info(&format!("{}: {} rows in {} file(s)", name, streamed, files.len()));
        Ok((files, expected))
    }

    fn write_data_file(
        &self,
        table: &Table,
        layout: &ExportLayout,
        file_name: &str,
        rows: &[Row],
        log: &SharedSink,
    ) -> Result<DataFile> {
        let encoded = encode_batch(table, rows, &self.options.compression)
            .map_err(|e| e.with_context(table.full_name(), "encode", None))?;
        write_file_atomic(&layout.data_file(file_name), &encoded.bytes)?;
        log.debug(&format!(
            "{}: wrote {} ({} rows, {} bytes, compression {:?})",
            table.full_name(),
            file_name,
            rows.len(),
            encoded.bytes.len(),
            encoded.compression
        ));
        Ok(DataFile {
            name: file_name.to_string(),
            rows: rows.len() as u64,
            bytes: encoded.bytes.len() as u64,
            sha256: sha256_hex(&encoded.bytes),
            compression: encoded.compression,
        })
    }

    /// DDL in the source dialect, for inspection.
    fn write_scripts(&self, layout: &ExportLayout, tables: &[Table]) -> Result<()> {
        let dialect = self.provider.dialect();
        let mut create = String::new();
        let mut indexes = String::new();
        let mut fks = String::new();
        for table in tables {
            create.push_str(&dialect.create_table_sql(table));
            create.push_str(";\n\n");
            for index in &table.indexes {
                indexes.push_str(&dialect.create_index_sql(table, index));
                indexes.push_str(";\n");
            }
            for fk in &table.foreign_keys {
                fks.push_str(&dialect.add_foreign_key_sql(table, fk));
                fks.push_str(";\n");
            }
        }
        let dir = layout.scripts_dir();
        write_file_atomic(&dir.join("create_tables.sql"), create.as_bytes())?;
        write_file_atomic(&dir.join("create_indexes.sql"), indexes.as_bytes())?;
        write_file_atomic(&dir.join("foreign_keys.sql"), fks.as_bytes())?;
        Ok(())
    }
}

/// Delete data files a previous run left for `table`, so a re-run never
/// mixes old and new batches.
fn remove_stale_files(layout: &ExportLayout, table: &Table) -> Result<()> {
    let stem = file_stem(&table.schema, &table.name);
    let batch_prefix = format!("{}_batch", stem);
    let entries = match std::fs::read_dir(layout.data_dir()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(base) = name.strip_suffix(".bin") else {
            continue;
        };
        let is_batch = base
            .strip_prefix(&batch_prefix)
            .map_or(false, |n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if base == stem || is_batch {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_batch_file;
    use crate::core::schema::{Column, FkAction, ForeignKey, LogicalType};
    use crate::core::value::SqlValue;
    use crate::drivers::memory::{FaultKind, MemoryProvider};
    use crate::logging::MemorySink;
    use tempfile::TempDir;

    fn customers() -> Table {
        let mut t = Table::new("dbo", "Customers");
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).identity(),
            Column::new("Name", LogicalType::varchar(100), 2),
        ];
        t.primary_key = Some(vec!["Id".into()]);
        t
    }

    fn orders() -> Table {
        let mut t = Table::new("dbo", "Orders");
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).not_null(),
            Column::new("CustomerId", LogicalType::Int, 2).not_null(),
        ];
        t.primary_key = Some(vec!["Id".into()]);
        t.foreign_keys.push(ForeignKey {
            name: "FK_Orders_Customers".into(),
            columns: vec!["CustomerId".into()],
            ref_schema: "dbo".into(),
            ref_table: "Customers".into(),
            ref_columns: vec!["Id".into()],
            on_delete: FkAction::Cascade,
            on_update: FkAction::NoAction,
        });
        t
    }

    fn seeded(customers_rows: i32, orders_rows: i32) -> Arc<MemoryProvider> {
        let db = MemoryProvider::new();
        db.seed_table(
            customers(),
            (1..=customers_rows)
                .map(|i| vec![SqlValue::I32(i), SqlValue::from(format!("c{}", i))])
                .collect(),
        );
        db.seed_table(
            orders(),
            (1..=orders_rows)
                .map(|i| vec![SqlValue::I32(i), SqlValue::I32(1)])
                .collect(),
        );
        Arc::new(db)
    }

    fn options(dir: &Path, batch_size: usize) -> ExportOptions {
        ExportOptions {
            batch_size,
            retry: RetryPolicy::none(),
            ..ExportOptions::new(dir)
        }
    }

    #[tokio::test]
    async fn test_batching_produces_numbered_files() {
        let dir = TempDir::new().unwrap();
        let db = seeded(3 * 4 + 7, 0);
        let mut opts = options(dir.path(), 4);
        opts.tables = vec!["dbo.Customers".into()];
        let result = Exporter::new(db, opts).run().await.unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        let manifest = ExportManifest::load(&dir.path().join("export_manifest.json")).unwrap();
        let entry = manifest.get("dbo.Customers").unwrap();
        let names: Vec<&str> = entry.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "dbo_Customers_batch1.bin",
                "dbo_Customers_batch2.bin",
                "dbo_Customers_batch3.bin",
                "dbo_Customers_batch4.bin"
            ]
        );
        let rows: Vec<u64> = entry.files.iter().map(|f| f.rows).collect();
        assert_eq!(rows, vec![4, 4, 4, 7]);
        let last = read_batch_file(&dir.path().join("data/dbo_Customers_batch4.bin")).unwrap();
        assert_eq!(last.rows.len(), 7);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_trailing_file() {
        let dir = TempDir::new().unwrap();
        let db = seeded(8, 0);
        let result = Exporter::new(db, options(dir.path(), 4)).run().await.unwrap();
        let customers = result.tables.iter().find(|t| t.table == "dbo.Customers").unwrap();
        assert_eq!(customers.files, 2);
        assert_eq!(customers.rows_succeeded, 8);
    }

    #[tokio::test]
    async fn test_single_file_and_empty_table() {
        let dir = TempDir::new().unwrap();
        let db = seeded(4, 0);
        Exporter::new(db, options(dir.path(), 4)).run().await.unwrap();
        assert!(dir.path().join("data/dbo_Customers.bin").exists());
        let empty = read_batch_file(&dir.path().join("data/dbo_Orders.bin")).unwrap();
        assert!(empty.rows.is_empty());
        assert_eq!(empty.header.table, "Orders");
    }

    #[tokio::test]
    async fn test_requested_table_pulls_in_referenced_tables() {
        let dir = TempDir::new().unwrap();
        let db = seeded(2, 3);
        let mut opts = options(dir.path(), 10);
        opts.tables = vec!["Orders".into(), "dbo.Missing".into()];
        let result = Exporter::new(db, opts).run().await.unwrap();

        let manifest = ExportManifest::load(&dir.path().join("export_manifest.json")).unwrap();
        assert!(manifest.get("dbo.Customers").is_some());
        assert_eq!(manifest.dependency_order, vec!["dbo.Customers", "dbo.Orders"]);
        assert!(matches!(result.status, RunStatus::PartiallyFailed { failed: 1, .. }));
        assert!(dir.path().join("dependencies.json").exists());
        assert!(dir.path().join("scripts/create_tables.sql").exists());
        assert!(dir.path().join("table_metadata/dbo_Orders.json").exists());
        assert!(dir.path().join("logs/export_log.txt").exists());
    }

    #[tokio::test]
    async fn test_filter_applies_to_one_table() {
        let dir = TempDir::new().unwrap();
        let db = seeded(10, 0);
        let mut opts = options(dir.path(), 100);
        opts.filters.insert("dbo.Customers".into(), "Id > 7".into());
        let result = Exporter::new(db, opts).run().await.unwrap();
        let customers = result.tables.iter().find(|t| t.table == "dbo.Customers").unwrap();
        assert_eq!(customers.rows_succeeded, 3);
        assert_eq!(customers.rows_attempted, 10);
    }

    #[tokio::test]
    async fn test_read_failure_is_per_table() {
        let dir = TempDir::new().unwrap();
        let db = seeded(2, 2);
        db.inject_read_fault("dbo.Orders", FaultKind::Permanent, 1);
        let sink = Arc::new(MemorySink::new());
        let result = Exporter::new(db, options(dir.path(), 10))
            .with_logger(sink.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::PartiallyFailed { failed: 1, total: 2 });
        assert!(dir.path().join("data/dbo_Customers.bin").exists());
        assert!(sink.contains("export failed"));
        let manifest = ExportManifest::load(&dir.path().join("export_manifest.json")).unwrap();
        assert!(manifest.get("dbo.Orders").unwrap().error.is_some());
    }

    fn retrying(dir: &Path, batch_size: usize) -> ExportOptions {
        ExportOptions {
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
                ..RetryPolicy::default()
            },
            ..options(dir, batch_size)
        }
    }

    #[tokio::test]
    async fn test_interrupted_read_resumes_after_last_file() {
        let dir = TempDir::new().unwrap();
        let db = seeded(10, 0);
        db.inject_read_fault("dbo.Customers", FaultKind::Transient, 2);
        let sink = Arc::new(MemorySink::new());
        let mut opts = retrying(dir.path(), 4);
        opts.tables = vec!["dbo.Customers".into()];
        let result = Exporter::new(db.clone(), opts)
            .with_logger(sink.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert!(sink.contains("read interrupted after 4 rows in 1 file(s)"));
        let manifest = ExportManifest::load(&dir.path().join("export_manifest.json")).unwrap();
        let entry = manifest.get("dbo.Customers").unwrap();
        let rows: Vec<u64> = entry.files.iter().map(|f| f.rows).collect();
        assert_eq!(rows, vec![4, 4, 2]);

        let mut read_back = Vec::new();
        for file in &entry.files {
            read_back.extend(read_batch_file(&dir.path().join("data").join(&file.name)).unwrap().rows);
        }
        assert_eq!(read_back, db.rows("dbo.Customers").unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_read_without_key_starts_over() {
        let dir = TempDir::new().unwrap();
        let mut heap = customers();
        heap.primary_key = None;
        let db = MemoryProvider::new();
        db.seed_table(
            heap,
            (1..=10)
                .map(|i| vec![SqlValue::I32(i), SqlValue::from(format!("c{}", i))])
                .collect(),
        );
        db.inject_read_fault("dbo.Customers", FaultKind::Transient, 1);
        let result = Exporter::new(Arc::new(db), retrying(dir.path(), 4))
            .run()
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.total_rows, 10);
        let manifest = ExportManifest::load(&dir.path().join("export_manifest.json")).unwrap();
        let rows: Vec<u64> = manifest
            .get("dbo.Customers")
            .unwrap()
            .files
            .iter()
            .map(|f| f.rows)
            .collect();
        assert_eq!(rows, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_read_retries_are_bounded() {
        let dir = TempDir::new().unwrap();
        let db = seeded(10, 0);
        db.inject_read_fault("dbo.Customers", FaultKind::Transient, 3);
        let mut opts = retrying(dir.path(), 4);
        opts.tables = vec!["dbo.Customers".into()];
        let result = Exporter::new(db, opts).run().await.unwrap();

        assert!(matches!(result.status, RunStatus::PartiallyFailed { failed: 1, .. }));
        let error = result.tables[0].error.as_deref().unwrap_or_default();
        assert!(error.contains("injected read failure"), "{}", error);
    }

    #[tokio::test]
    async fn test_rerun_replaces_stale_batch_files() {
        let dir = TempDir::new().unwrap();
        let db = seeded(9, 0);
        Exporter::new(db.clone(), options(dir.path(), 4)).run().await.unwrap();
        assert!(dir.path().join("data/dbo_Customers_batch3.bin").exists());

        Exporter::new(db, options(dir.path(), 100)).run().await.unwrap();
        assert!(dir.path().join("data/dbo_Customers.bin").exists());
        assert!(!dir.path().join("data/dbo_Customers_batch1.bin").exists());
        assert!(!dir.path().join("data/dbo_Customers_batch3.bin").exists());
    }

    #[tokio::test]
    async fn test_cancelled_export_writes_no_manifest() {
        let dir = TempDir::new().unwrap();
        let db = seeded(2, 2);
        let token = CancellationToken::new();
        token.cancel();
        let result = Exporter::new(db, options(dir.path(), 10))
            .with_cancellation(token)
            .run()
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.manifest_path.is_none());
        assert!(!dir.path().join("export_manifest.json").exists());
    }

    #[tokio::test]
    async fn test_export_single_table() {
        let dir = TempDir::new().unwrap();
        let db = seeded(5, 0);
        let exporter = Exporter::new(db, options(dir.path(), 2));
        let files = exporter
            .export_single_table(&customers(), &dir.path().join("one"))
            .await
            .unwrap();
        assert_eq!(files.len(), 3);
        assert!(!dir.path().join("one/export_manifest.json").exists());
    }
}
