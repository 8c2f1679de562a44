//! Read-only inspection of exported files.
//!
//! [`validate_file`] explains a single `.bin` file: how big it is, whether
//! it is compressed, what the header says, and where decoding stopped if it
//! failed. [`validate_export`] checks a whole export directory against its
//! manifest without touching a database.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::{decode_batch, read_header, Compression, DecodeError};
use crate::error::Result;
use crate::manifest::{ExportLayout, ExportManifest, TableStatus};

/// Column as recorded in a file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticColumn {
    pub name: String,
    pub logical_type: String,
    pub nullable: bool,
}

/// Everything learned from one batch file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub path: PathBuf,
    pub file_size: u64,
    pub is_compressed: bool,
    pub compression: Compression,
    pub decompressed_size: Option<u64>,
    /// Whether every row decoded.
    pub deserialized: bool,
    pub schema_name: Option<String>,
    pub table_name: Option<String>,
    /// Row count declared in the header.
    pub row_count: Option<u64>,
    pub columns: Vec<DiagnosticColumn>,
    /// Step-by-step trace, including the failure position on error.
    pub logs: Vec<String>,
}

impl DiagnosticResult {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file_size: 0,
            is_compressed: false,
            compression: Compression::None,
            decompressed_size: None,
            deserialized: false,
            schema_name: None,
            table_name: None,
            row_count: None,
            columns: Vec::new(),
            logs: Vec::new(),
        }
    }

    fn record_failure(&mut self, e: &DecodeError) {
        self.logs.push(format!("Decode failed: {}", e.kind));
        self.logs.push(format!(
            "Offset {} of {} bytes{}",
            e.offset,
            e.total_size,
            if e.compression.is_compressed() { " (decompressed)" } else { "" }
        ));
        if !e.sample.is_empty() {
            self.logs.push(format!("Bytes at offset: {}", e.sample_hex()));
        }
    }

    /// Human-readable report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "File:         {}", self.path.display());
        let _ = writeln!(out, "Size:         {} bytes", self.file_size);
        let _ = writeln!(
            out,
            "Compression:  {}",
            match self.compression {
                Compression::None => "none",
                Compression::Gzip => "gzip",
                Compression::Bzip2 => "bzip2",
            }
        );
        if let Some(size) = self.decompressed_size {
            let _ = writeln!(out, "Decompressed: {} bytes", size);
        }
        if let (Some(schema), Some(table)) = (&self.schema_name, &self.table_name) {
            let _ = writeln!(out, "Table:        {}.{}", schema, table);
        }
        if let Some(rows) = self.row_count {
            let _ = writeln!(out, "Rows:         {}", rows);
        }
        if !self.columns.is_empty() {
            let _ = writeln!(out, "Columns:");
            for c in &self.columns {
                let _ = writeln!(
                    out,
                    "  {} {}{}",
                    c.name,
                    c.logical_type,
                    if c.nullable { "" } else { " NOT NULL" }
                );
            }
        }
        let _ = writeln!(out, "Status:       {}", if self.deserialized { "OK" } else { "FAILED" });
        for line in &self.logs {
            let _ = writeln!(out, "  {}", line);
        }
        out
    }
}

/// Inspect one batch file.
///
/// Only an unreadable file is an error; decode problems are reported in the
/// result with `deserialized = false`.
pub fn validate_file(path: &Path) -> Result<DiagnosticResult> {
    let bytes = std::fs::read(path)?;
    let mut result = DiagnosticResult::new(path);
    result.file_size = bytes.len() as u64;
    result.compression = Compression::detect(&bytes);
    result.is_compressed = result.compression.is_compressed();
    result.logs.push(format!(
        "Read {} bytes, leading signature: {:?}",
        bytes.len(),
        result.compression
    ));

    match read_header(&bytes) {
        Ok((header, _, decompressed)) => {
            result.decompressed_size = decompressed.map(|n| n as u64);
            result.schema_name = Some(header.schema.clone());
            result.table_name = Some(header.table.clone());
            result.row_count = Some(header.row_count);
            result.columns = header
                .columns
                .iter()
                .map(|c| DiagnosticColumn {
                    name: c.name.clone(),
                    logical_type: c.logical_type.to_string(),
                    nullable: c.nullable,
                })
                .collect();
            result.logs.push(format!(
                "Header: format v{}, {}.{}, {} columns, {} rows declared",
                header.version,
                header.schema,
                header.table,
                header.columns.len(),
                header.row_count
            ));
        }
        Err(e) => {
            result.decompressed_size = e.decompressed_size.map(|n| n as u64);
            result.record_failure(&e);
            return Ok(result);
        }
    }

    match decode_batch(&bytes) {
        Ok(batch) => {
            result.deserialized = true;
            result.logs.push(format!("Decoded {} rows", batch.rows.len()));
        }
        Err(e) => result.record_failure(&e),
    }
    Ok(result)
}

/// Outcome of checking an export directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportValidation {
    pub tables: usize,
    pub files_checked: usize,
    pub rows: u64,
    pub issues: Vec<String>,
}

impl ExportValidation {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check an export directory against its manifest.
///
/// A missing or unparseable manifest is an error; everything else is
/// collected into `issues`.
pub fn validate_export(dir: &Path) -> Result<ExportValidation> {
    let layout = ExportLayout::new(dir);
    let manifest = ExportManifest::load(&layout.manifest_path())?;
    let mut report = ExportValidation {
        tables: manifest.tables.len(),
        ..Default::default()
    };
    if let Err(e) = manifest.validate() {
        report.issues.push(e.to_string());
    }

    for (name, entry) in &manifest.tables {
        if entry.status == TableStatus::Failed {
            report.issues.push(format!(
                "{}: export failed: {}",
                name,
                entry.error.as_deref().unwrap_or("unknown error")
            ));
            continue;
        }
        for file in &entry.files {
            report.files_checked += 1;
            let path = layout.data_file(&file.name);
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    report.issues.push(format!("{}: {}: {}", name, file.name, e));
                    continue;
                }
            };
            if let Err(e) = file.verify(&bytes) {
                report.issues.push(e.to_string());
                continue;
            }
            match decode_batch(&bytes) {
                Ok(batch) if batch.rows.len() as u64 == file.rows => {
                    report.rows += file.rows;
                }
                Ok(batch) => report.issues.push(format!(
                    "{}: manifest records {} rows, file holds {}",
                    file.name,
                    file.rows,
                    batch.rows.len()
                )),
                Err(e) => report.issues.push(format!("{}: {}", file.name, e)),
            }
        }
    }
    Ok(report)
}
