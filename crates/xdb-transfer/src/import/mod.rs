//! Importer: export directory to a target database.
//!
//! Per run: load the manifest (fatal if missing), resolve the dependency
//! order, then for each table create it (unless present), stream its data
//! files through the codec and insert them in transactional batches. A
//! table's foreign keys are added as soon as it is loaded when their parent
//! is already loaded; deferred foreign keys wait until every table is in.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::decode_batch;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::core::schema::{ForeignKey, Table};
use crate::core::traits::{table_matches, Provider};
use crate::error::{MigrateError, Result};
use crate::logging::{tracing_sink, FanoutSink, FileSink, LogSink, SharedSink};
use crate::manifest::{ExportLayout, ExportManifest, ManifestTable, TableStatus as ExportStatus};
use crate::outcome::{RunStatus, TableOutcome, TableStatus};
use crate::resolver::{self, DeferredConstraint};
use crate::retry::{OperationClass, RetryPolicy};

/// Import settings.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub input_dir: PathBuf,
    /// Subset of manifest tables. Empty imports all.
    pub tables: Vec<String>,
    /// Rows per insert transaction.
    pub batch_size: usize,
    pub create_schema: bool,
    pub create_foreign_keys: bool,
    pub continue_on_error: bool,
    pub verify_checksums: bool,
    /// Load every table into this schema.
    pub target_schema: Option<String>,
    pub retry: RetryPolicy,
}

impl ImportOptions {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            create_schema: true,
            create_foreign_keys: true,
            continue_on_error: false,
            verify_checksums: true,
            target_schema: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// A foreign key that was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnappliedConstraint {
    pub table: String,
    pub constraint: String,
    pub references: String,
    pub reason: String,
}

/// Result of an import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub status: RunStatus,
    pub tables: Vec<TableOutcome>,
    /// Foreign keys added right after their table loaded, in order.
    pub foreign_keys_applied: Vec<String>,
    /// Deferred foreign keys added after every table loaded.
    pub deferred_applied: Vec<String>,
    pub unapplied_constraints: Vec<UnappliedConstraint>,
    pub total_rows: u64,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ImportResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One table scheduled for import.
struct Planned<'a> {
    entry: &'a ManifestTable,
    /// Definition with any schema remap applied.
    table: Table,
}

/// Replays an export directory into one provider.
pub struct Importer {
    provider: Arc<dyn Provider>,
    options: ImportOptions,
    log: SharedSink,
    cancel: CancellationToken,
}

impl Importer {
    pub fn new(provider: Arc<dyn Provider>, options: ImportOptions) -> Self {
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

    /// Run a full import.
    ///
    /// A missing or invalid manifest fails the call. Table failures are
    /// reported in the result; without `continue_on_error` the first one
    /// aborts the run.
    pub async fn run(&self) -> Result<ImportResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let layout = ExportLayout::new(&self.options.input_dir);

        info!("Phase 1: Loading manifest");
        let manifest = ExportManifest::load(&layout.manifest_path())?;
        manifest.validate()?;
        let log = self.open_log(&layout);
        log.info(&format!(
            "Import started: {} tables from {} export, target provider {}",
            manifest.tables.len(),
            manifest.source_provider,
            self.provider.name()
        ));

        let planned = self.plan(&manifest, &log);
        let tables: Vec<Table> = planned.values().map(|p| p.table.clone()).collect();

        info!("Phase 2: Resolving dependency order");
        let resolved = resolver::resolve(&tables);
        log.info(&format!("Import order: {}", resolved.order.join(", ")));
        for d in &resolved.deferred {
            log.info(&format!(
                "{}: {} deferred ({:?})",
                d.table, d.foreign_key.name, d.reason
            ));
        }

        let mut unapplied: Vec<UnappliedConstraint> = Vec::new();
        if self.options.create_foreign_keys {
            for ext in &resolved.external {
                let reason = format!("referenced table {} is not in this run", ext.foreign_key.ref_full_name());
                log.warn(&format!("{}: {} not applied: {}", ext.table, ext.foreign_key.name, reason));
                unapplied.push(unapplied_from(ext, reason));
            }
        }

        info!("Phase 3: Loading tables");
        let mut outcomes: Vec<TableOutcome> = Vec::new();
        let mut loaded: BTreeSet<String> = BTreeSet::new();
        let mut applied: Vec<String> = Vec::new();
        let mut aborted: Option<String> = None;
        let mut cancelled = false;

        for name in &resolved.order {
            let Some(plan) = planned.get(name) else {
                continue;
            };
            if aborted.is_some() || cancelled || self.cancel.is_cancelled() {
                cancelled |= self.cancel.is_cancelled();
                let mut skipped = TableOutcome::new(name.clone());
                skipped.rows_attempted = plan.entry.row_count;
                outcomes.push(skipped);
                continue;
            }

            let table_start = Instant::now();
            let mut outcome = TableOutcome::new(name.clone());
            outcome.rows_attempted = plan.entry.row_count;
            outcome.files = plan.entry.files.len();
            let loaded_rows = self.import_table(plan, &layout, &log, &mut outcome).await;
            outcome.duration_seconds = table_start.elapsed().as_secs_f64();

            match loaded_rows {
                Ok(()) => {
                    outcome.status = TableStatus::Succeeded;
                    loaded.insert(name.clone());
                    log.info(&format!(
                        "{}: {} of {} rows loaded",
                        name, outcome.rows_succeeded, outcome.rows_attempted
                    ));
                    if self.options.create_foreign_keys {
                        self.apply_immediate_fks(
                            &plan.table,
                            &resolved.deferred,
                            &planned,
                            &loaded,
                            &log,
                            &mut applied,
                            &mut unapplied,
                        )
                        .await;
                    }
                }
                Err(e) if e.is_cancelled() => {
                    cancelled = true;
                    log.warn(&format!("{}: cancelled after {} rows", name, outcome.rows_succeeded));
                    outcome.status = TableStatus::Skipped;
                }
                Err(e) => {
                    log.error(&format!("{}: import failed: {}", name, e));
                    outcome = outcome.failed(&e);
                    if !self.options.continue_on_error {
                        aborted = Some(format!("{}: {}", name, e));
                    }
                }
            }
            outcomes.push(outcome);
        }

        let mut deferred_applied = Vec::new();
        if self.options.create_foreign_keys {
            if aborted.is_none() && !cancelled {
                info!("Phase 4: Applying deferred constraints");
            }
            for d in &resolved.deferred {
                let parent = d.foreign_key.ref_full_name();
                let reason = if aborted.is_some() || cancelled {
                    Some("run did not complete".to_string())
                } else if !loaded.contains(&d.table) || !loaded.contains(&parent) {
                    Some(format!("{} or {} was not loaded", d.table, parent))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    unapplied.push(unapplied_from(d, reason));
                    continue;
                }
                let Some(plan) = planned.get(&d.table) else {
                    continue;
                };
                match self.create_fk(&plan.table, &d.foreign_key).await {
                    Ok(()) => {
                        log.info(&format!("{}: deferred {} applied", d.table, d.foreign_key.name));
                        deferred_applied.push(d.foreign_key.name.clone());
                    }
                    Err(e) => {
                        log.error(&format!("{}: {} failed: {}", d.table, d.foreign_key.name, e));
                        unapplied.push(unapplied_from(d, e.to_string()));
                    }
                }
            }
        }

        let status = match aborted {
            Some(reason) => RunStatus::Aborted { reason },
            None => RunStatus::summarize(&outcomes, unapplied.len(), cancelled),
        };
        let result = ImportResult {
            status,
            total_rows: outcomes.iter().map(|t| t.rows_succeeded).sum(),
            tables: outcomes,
            foreign_keys_applied: applied,
            deferred_applied,
            unapplied_constraints: unapplied,
            duration_seconds: start.elapsed().as_secs_f64(),
            started_at,
            completed_at: Utc::now(),
        };
        for u in &result.unapplied_constraints {
            log.warn(&format!("Unapplied: {}.{} -> {} ({})", u.table, u.constraint, u.references, u.reason));
        }
        log.info(&format!(
            "Import {}: {} tables, {} rows in {:.1}s",
            result.status.label(),
            result.tables.len(),
            result.total_rows,
            result.duration_seconds
        ));
        Ok(result)
    }

    /// The caller's sink plus `logs/import_log.txt` when it can be created.
    fn open_log(&self, layout: &ExportLayout) -> SharedSink {
        match FileSink::create(&layout.import_log()) {
            Ok(file) => Arc::new(FanoutSink::new(vec![self.log.clone(), Arc::new(file)])),
            Err(e) => {
                warn!("cannot open {}: {}", layout.import_log().display(), e);
                self.log.clone()
            }
        }
    }

    /// Exported manifest tables in scope, keyed by remapped full name.
    fn plan<'a>(&self, manifest: &'a ExportManifest, log: &SharedSink) -> BTreeMap<String, Planned<'a>> {
        let mut planned = BTreeMap::new();
        for entry in manifest.tables.values() {
            if !self.options.tables.is_empty() && !table_matches(&entry.table, &self.options.tables) {
                continue;
            }
            if entry.status != ExportStatus::Exported {
                log.warn(&format!(
                    "{}: skipped, export failed: {}",
                    entry.table.full_name(),
                    entry.error.as_deref().unwrap_or("unknown error")
                ));
                continue;
            }
            let mut table = entry.table.clone();
            if let Some(schema) = &self.options.target_schema {
                table.schema = schema.clone();
                for fk in &mut table.foreign_keys {
                    fk.ref_schema = schema.clone();
                }
            }
            planned.insert(table.full_name(), Planned { entry, table });
        }
        planned
    }

    /// Create (if needed) and load one table. Updates `outcome` as batches commit.
    async fn import_table(
        &self,
        plan: &Planned<'_>,
        layout: &ExportLayout,
        log: &SharedSink,
        outcome: &mut TableOutcome,
    ) -> Result<()> {
        let table = &plan.table;
        let name = table.full_name();
        let retry = &self.options.retry;

        if self.options.create_schema {
            let exists = retry
                .run(OperationClass::Metadata, true, "table exists", || {
                    self.provider.table_exists(&table.schema, &table.name)
                })
                .await
                .map_err(|e| e.with_context(&name, "create", None))?;
            if exists {
                log.info(&format!("{}: already exists, skipping DDL", name));
            } else {
                retry
                    .run(OperationClass::Metadata, false, "create table", || {
                        self.provider.create_table(table)
                    })
                    .await
                    .map_err(|e| e.with_context(&name, "create table", None))?;
                for index in &table.indexes {
                    retry
                        .run(OperationClass::Metadata, false, "create index", || {
                            self.provider.create_index(table, index)
                        })
                        .await
                        .map_err(|e| e.with_context(&name, "create index", None))?;
                }
                log.info(&format!("{}: created with {} index(es)", name, table.indexes.len()));
            }
        }

        let batch_size = self.options.batch_size.max(1);
        let mut batch_no = 0usize;
        for file in &plan.entry.files {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            let path = layout.data_file(&file.name);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| MigrateError::from(e).with_context(&name, "read file", None))?;
            if self.options.verify_checksums {
                file.verify(&bytes)?;
            }
            let decoded = decode_batch(&bytes)
                .map_err(|e| MigrateError::from(e).with_context(&name, format!("decode {}", file.name), None))?;
            if decoded.rows.len() as u64 != file.rows {
                return Err(MigrateError::Manifest(format!(
                    "{}: manifest records {} rows, file holds {}",
                    file.name,
                    file.rows,
                    decoded.rows.len()
                )));
            }
            let columns: Vec<String> = decoded.header.columns.iter().map(|c| c.name.clone()).collect();
            if let Some(missing) = columns.iter().find(|c| table.column(c).is_none()) {
                return Err(MigrateError::Manifest(format!(
                    "{}: column '{}' is not in the table definition",
                    file.name, missing
                )));
            }
            let identity_insert = table
                .identity_columns()
                .iter()
                .any(|c| columns.contains(&c.name));

            let mut rows = decoded.rows;
            while !rows.is_empty() {
                let rest = rows.split_off(batch_size.min(rows.len()));
                let chunk = std::mem::replace(&mut rows, rest);
                batch_no += 1;
                if self.cancel.is_cancelled() {
                    return Err(MigrateError::Cancelled);
                }
                // Cancellation inside write_batch rolls the batch back.
                let written = retry
                    .run(OperationClass::Transfer, true, "write batch", || {
                        self.provider.write_batch(
                            table,
                            &columns,
                            chunk.clone(),
                            identity_insert,
                            &self.cancel,
                        )
                    })
                    .await
                    .map_err(|e| e.with_context(&name, "insert", Some(batch_no)))?;
                outcome.rows_succeeded += written;
            }
            log.debug(&format!("{}: loaded {}", name, file.name));
        }
        Ok(())
    }

    /// Add `table`'s non-deferred foreign keys whose parent is loaded.
    #[allow(clippy::too_many_arguments)]
    async fn apply_immediate_fks(
        &self,
        table: &Table,
        deferred: &[DeferredConstraint],
        planned: &BTreeMap<String, Planned<'_>>,
        loaded: &BTreeSet<String>,
        log: &SharedSink,
        applied: &mut Vec<String>,
        unapplied: &mut Vec<UnappliedConstraint>,
    ) {
        let name = table.full_name();
        for fk in &table.foreign_keys {
            let parent = fk.ref_full_name();
            if !planned.contains_key(&parent) || deferred.iter().any(|d| d.table == name && d.foreign_key.name == fk.name) {
                continue;
            }
            if !loaded.contains(&parent) {
                let reason = format!("referenced table {} was not loaded", parent);
                log.warn(&format!("{}: {} not applied: {}", name, fk.name, reason));
                unapplied.push(UnappliedConstraint {
                    table: name.clone(),
                    constraint: fk.name.clone(),
                    references: parent,
                    reason,
                });
                continue;
            }
            match self.create_fk(table, fk).await {
                Ok(()) => {
                    log.info(&format!("{}: {} applied", name, fk.name));
                    applied.push(fk.name.clone());
                }
                Err(e) => {
                    log.error(&format!("{}: {} failed: {}", name, fk.name, e));
                    unapplied.push(UnappliedConstraint {
                        table: name.clone(),
                        constraint: fk.name.clone(),
                        references: parent,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn create_fk(&self, table: &Table, fk: &ForeignKey) -> Result<()> {
        self.options
            .retry
            .run(OperationClass::Metadata, false, "add constraint", || {
                self.provider.create_foreign_key(table, fk)
            })
            .await
    }
}

fn unapplied_from(d: &DeferredConstraint, reason: String) -> UnappliedConstraint {
    UnappliedConstraint {
        table: d.table.clone(),
        constraint: d.foreign_key.name.clone(),
        references: d.foreign_key.ref_full_name(),
        reason,
    }
}
