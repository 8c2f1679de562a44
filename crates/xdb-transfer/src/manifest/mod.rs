//! Export manifest and on-disk layout.
//!
//! The manifest is written once at the end of an export and is read-only
//! during import. It records, per table, the schema snapshot, the exact row
//! count, and every data file with its size and SHA-256, plus the global
//! dependency order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::{write_file_atomic, Compression};
use crate::core::identifier::file_stem;
use crate::core::schema::Table;
use crate::error::{MigrateError, Result};
use crate::resolver::{self, DeferredConstraint, DependencyEdge};

pub const MANIFEST_FILE: &str = "export_manifest.json";
pub const DEPENDENCIES_FILE: &str = "dependencies.json";

/// Highest manifest version this build reads.
pub const MANIFEST_VERSION: u32 = 1;

/// Paths inside an export directory.
#[derive(Debug, Clone)]
pub struct ExportLayout {
    root: PathBuf,
}

impl ExportLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn dependencies_path(&self) -> PathBuf {
        self.root.join(DEPENDENCIES_FILE)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir().join(name)
    }

    pub fn table_metadata_dir(&self) -> PathBuf {
        self.root.join("table_metadata")
    }

    pub fn table_metadata_file(&self, schema: &str, table: &str) -> PathBuf {
        self.table_metadata_dir()
            .join(format!("{}.json", file_stem(schema, table)))
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn export_log(&self) -> PathBuf {
        self.logs_dir().join("export_log.txt")
    }

    pub fn import_log(&self) -> PathBuf {
        self.logs_dir().join("import_log.txt")
    }

    /// Create `data/` and `logs/`, plus the optional companions requested.
    pub fn create_dirs(&self, scripts: bool, table_metadata: bool) -> Result<()> {
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        if scripts {
            std::fs::create_dir_all(self.scripts_dir())?;
        }
        if table_metadata {
            std::fs::create_dir_all(self.table_metadata_dir())?;
        }
        Ok(())
    }
}

/// Data file name for a single-file table.
pub fn single_file_name(schema: &str, table: &str) -> String {
    format!("{}.bin", file_stem(schema, table))
}

/// Data file name for batch `index` (1-based) of a multi-file table.
pub fn batch_file_name(schema: &str, table: &str, index: usize) -> String {
    format!("{}_batch{}.bin", file_stem(schema, table), index)
}

/// Lowercase hex SHA-256, as recorded for every data file.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Exported,
    Failed,
}

/// One `.bin` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// File name relative to `data/`.
    pub name: String,
    pub rows: u64,
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    pub compression: Compression,
}

impl DataFile {
    /// Fail with a manifest error unless `bytes` match the recorded checksum.
    pub fn verify(&self, bytes: &[u8]) -> Result<()> {
        let actual = sha256_hex(bytes);
        if actual != self.sha256 {
            return Err(MigrateError::Manifest(format!(
                "{}: checksum mismatch (expected {}, found {})",
                self.name, self.sha256, actual
            )));
        }
        Ok(())
    }
}

/// Manifest entry for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestTable {
    pub table: Table,
    pub row_count: u64,
    pub files: Vec<DataFile>,
    pub exported_at: DateTime<Utc>,
    pub status: TableStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestTable {
    pub fn exported(table: Table, files: Vec<DataFile>) -> Self {
        Self {
            row_count: files.iter().map(|f| f.rows).sum(),
            table,
            files,
            exported_at: Utc::now(),
            status: TableStatus::Exported,
            error: None,
        }
    }

    pub fn failed(table: Table, error: impl Into<String>) -> Self {
        Self {
            table,
            row_count: 0,
            files: Vec::new(),
            exported_at: Utc::now(),
            status: TableStatus::Failed,
            error: Some(error.into()),
        }
    }

    /// Column list snapshot at export time.
    pub fn columns(&self) -> Vec<String> {
        self.table.column_names()
    }
}

/// The export run's index of tables, row counts and files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub format_version: u32,
    pub tool_version: String,
    pub source_provider: String,
    pub created_at: DateTime<Utc>,
    pub tables: BTreeMap<String, ManifestTable>,
    /// Creation order over every table in the manifest.
    pub dependency_order: Vec<String>,
    #[serde(default)]
    pub deferred_constraints: Vec<DeferredConstraint>,
}

impl ExportManifest {
    pub fn new(source_provider: impl Into<String>) -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            source_provider: source_provider.into(),
            created_at: Utc::now(),
            tables: BTreeMap::new(),
            dependency_order: Vec::new(),
            deferred_constraints: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: ManifestTable) {
        self.tables.insert(entry.table.full_name(), entry);
    }

    pub fn get(&self, full_name: &str) -> Option<&ManifestTable> {
        self.tables.get(full_name)
    }

    /// Schema definitions of every table in the manifest.
    pub fn table_definitions(&self) -> Vec<Table> {
        self.tables.values().map(|t| t.table.clone()).collect()
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.values().map(|t| t.row_count).sum()
    }

    /// Compute the dependency order and deferred constraints from the
    /// recorded foreign keys.
    pub fn finalize(&mut self) {
        let resolved = resolver::resolve(&self.table_definitions());
        self.dependency_order = resolved.order;
        self.deferred_constraints = resolved.deferred;
    }

    /// Raw FK edges, as written to `dependencies.json`.
    pub fn dependency_edges(&self) -> Vec<DependencyEdge> {
        resolver::dependency_edges(&self.table_definitions())
    }

    /// Check FK closure and per-table file bookkeeping.
    pub fn validate(&self) -> Result<()> {
        for (name, entry) in &self.tables {
            if *name != entry.table.full_name() {
                return Err(MigrateError::Manifest(format!(
                    "entry '{}' holds table {}",
                    name,
                    entry.table.full_name()
                )));
            }
            for fk in &entry.table.foreign_keys {
                let referenced = fk.ref_full_name();
                if !self.tables.contains_key(&referenced) {
                    return Err(MigrateError::Manifest(format!(
                        "{} references {} through {}, which is not in the export",
                        name, referenced, fk.name
                    )));
                }
            }
            if entry.status == TableStatus::Exported {
                let file_rows: u64 = entry.files.iter().map(|f| f.rows).sum();
                if file_rows != entry.row_count {
                    return Err(MigrateError::Manifest(format!(
                        "{}: row_count {} but files hold {} rows",
                        name, entry.row_count, file_rows
                    )));
                }
                if entry.files.is_empty() {
                    return Err(MigrateError::Manifest(format!("{}: no data files", name)));
                }
            }
        }
        Ok(())
    }

    /// Write the manifest atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_file_atomic(path, content.as_bytes())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Manifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        let manifest: Self = serde_json::from_str(&content).map_err(|e| {
            MigrateError::Manifest(format!("cannot parse {}: {}", path.display(), e))
        })?;
        if manifest.format_version > MANIFEST_VERSION {
            return Err(MigrateError::Manifest(format!(
                "{} has format version {}, this build reads up to {}",
                path.display(),
                manifest.format_version,
                MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }
}

pub fn save_dependencies(path: &Path, edges: &[DependencyEdge]) -> Result<()> {
    let content = serde_json::to_string_pretty(edges)?;
    write_file_atomic(path, content.as_bytes())
}

pub fn load_dependencies(path: &Path) -> Result<Vec<DependencyEdge>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MigrateError::Manifest(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| MigrateError::Manifest(format!("cannot parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{Column, FkAction, ForeignKey, LogicalType};
    use tempfile::TempDir;

    fn table(name: &str, parent: Option<&str>) -> Table {
        let mut t = Table::new("dbo", name);
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).not_null(),
            Column::new("ParentId", LogicalType::Int, 2),
        ];
        t.primary_key = Some(vec!["Id".into()]);
        if let Some(parent) = parent {
            t.foreign_keys.push(ForeignKey {
                name: format!("FK_{}_{}", name, parent),
                columns: vec!["ParentId".into()],
                ref_schema: "dbo".into(),
                ref_table: parent.into(),
                ref_columns: vec!["Id".into()],
                on_delete: FkAction::NoAction,
                on_update: FkAction::NoAction,
            });
        }
        t
    }

    fn file(name: &str, rows: u64) -> DataFile {
        DataFile {
            name: name.into(),
            rows,
            bytes: 10,
            sha256: "00".into(),
            compression: Compression::None,
        }
    }

    #[test]
    fn test_data_file_verify() {
        let mut f = file("a.bin", 1);
        f.sha256 = sha256_hex(b"payload");
        assert!(f.verify(b"payload").is_ok());
        assert!(matches!(f.verify(b"tampered"), Err(MigrateError::Manifest(_))));
    }

    #[test]
    fn test_file_names() {
        assert_eq!(single_file_name("dbo", "Orders"), "dbo_Orders.bin");
        assert_eq!(batch_file_name("dbo", "Orders", 3), "dbo_Orders_batch3.bin");
    }

    #[test]
    fn test_finalize_orders_parents_first() {
        let mut m = ExportManifest::new("mssql");
        m.insert(ManifestTable::exported(table("Orders", Some("Customers")), vec![file("a", 2)]));
        m.insert(ManifestTable::exported(table("Customers", None), vec![file("b", 1)]));
        m.finalize();
        assert_eq!(m.dependency_order, vec!["dbo.Customers", "dbo.Orders"]);
        assert_eq!(m.total_rows(), 3);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_referenced_table() {
        let mut m = ExportManifest::new("mssql");
        m.insert(ManifestTable::exported(table("Orders", Some("Customers")), vec![file("a", 2)]));
        let err = m.validate().unwrap_err();
        assert!(matches!(err, MigrateError::Manifest(_)));
    }

    #[test]
    fn test_validate_rejects_row_count_drift() {
        let mut m = ExportManifest::new("mssql");
        let mut entry = ManifestTable::exported(table("Customers", None), vec![file("a", 2)]);
        entry.row_count = 5;
        m.insert(entry);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let layout = ExportLayout::new(dir.path());
        let mut m = ExportManifest::new("postgres");
        m.insert(ManifestTable::exported(table("Customers", None), vec![file("a", 2)]));
        m.insert(ManifestTable::failed(table("Broken", None), "boom"));
        m.finalize();
        m.save(&layout.manifest_path()).unwrap();

        let loaded = ExportManifest::load(&layout.manifest_path()).unwrap();
        assert_eq!(loaded.source_provider, "postgres");
        assert_eq!(loaded.tables.len(), 2);
        assert_eq!(loaded.get("dbo.Broken").unwrap().status, TableStatus::Failed);
        assert_eq!(
            loaded.get("dbo.Customers").unwrap().columns(),
            vec!["Id".to_string(), "ParentId".to_string()]
        );
    }

    #[test]
    fn test_load_missing_is_manifest_error() {
        let dir = TempDir::new().unwrap();
        let err = ExportManifest::load(&dir.path().join(MANIFEST_FILE)).unwrap_err();
        assert!(matches!(err, MigrateError::Manifest(_)));
        assert_eq!(err.exit_code(), crate::error::exit_codes::DATA);
    }

    #[test]
    fn test_load_garbage_is_manifest_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ExportManifest::load(&path).unwrap_err(),
            MigrateError::Manifest(_)
        ));
    }
}
