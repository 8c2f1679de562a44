//! Schema and metadata types for tables, columns, indexes and foreign keys.
//!
//! These types are provider-agnostic. Native type strings are kept verbatim
//! next to the [`LogicalType`] so an unrecognized type is never coerced away.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Provider-independent column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogicalType {
    Boolean,
    /// Unsigned 8-bit integer (SQL Server `tinyint`).
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Double,
    Decimal {
        precision: u8,
        scale: u8,
    },
    String {
        max_length: Option<u32>,
        #[serde(default)]
        unicode: bool,
    },
    Binary {
        max_length: Option<u32>,
    },
    Date,
    Time,
    /// Timestamp without time zone.
    DateTime,
    /// Timestamp with an offset from UTC.
    DateTimeOffset,
    Guid,
    /// Anything the providers do not map; values travel as text.
    Other {
        name: String,
    },
}

impl LogicalType {
    /// Shorthand for an unbounded unicode string.
    pub fn text() -> Self {
        LogicalType::String {
            max_length: None,
            unicode: true,
        }
    }

    /// Shorthand for a bounded unicode string.
    pub fn varchar(max_length: u32) -> Self {
        LogicalType::String {
            max_length: Some(max_length),
            unicode: true,
        }
    }

    /// Whether the type belongs to the integer family.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            LogicalType::TinyInt | LogicalType::SmallInt | LogicalType::Int | LogicalType::BigInt
        )
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Boolean => write!(f, "boolean"),
            LogicalType::TinyInt => write!(f, "tinyint"),
            LogicalType::SmallInt => write!(f, "smallint"),
            LogicalType::Int => write!(f, "int"),
            LogicalType::BigInt => write!(f, "bigint"),
            LogicalType::Real => write!(f, "real"),
            LogicalType::Double => write!(f, "double"),
            LogicalType::Decimal { precision, scale } => write!(f, "decimal({},{})", precision, scale),
            LogicalType::String {
                max_length: Some(n),
                ..
            } => write!(f, "string({})", n),
            LogicalType::String { max_length: None, .. } => write!(f, "string"),
            LogicalType::Binary { max_length: Some(n) } => write!(f, "binary({})", n),
            LogicalType::Binary { max_length: None } => write!(f, "binary"),
            LogicalType::Date => write!(f, "date"),
            LogicalType::Time => write!(f, "time"),
            LogicalType::DateTime => write!(f, "datetime"),
            LogicalType::DateTimeOffset => write!(f, "datetimeoffset"),
            LogicalType::Guid => write!(f, "guid"),
            LogicalType::Other { name } => write!(f, "other({})", name),
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Mapped logical type.
    pub logical_type: LogicalType,

    /// Type name exactly as the source catalog reported it.
    #[serde(default)]
    pub native_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Default expression, dialect-specific and carried verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,

    /// Ordinal position (1-based).
    pub ordinal: u32,

    /// Identity / auto-increment column.
    #[serde(default)]
    pub is_identity: bool,
}

impl Column {
    /// Build a column with the common defaults (nullable, no default, not identity).
    pub fn new(name: impl Into<String>, logical_type: LogicalType, ordinal: u32) -> Self {
        Self {
            name: name.into(),
            native_type: String::new(),
            logical_type,
            is_nullable: true,
            default_value: None,
            ordinal,
            is_identity: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.is_nullable = false;
        self
    }
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

/// Referential action for ON DELETE / ON UPDATE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FkAction {
    Cascade,
    SetNull,
    Restrict,
    #[default]
    NoAction,
}

impl FkAction {
    /// Parse a catalog action string (`CASCADE`, `SET_NULL`, `set null`, ...).
    ///
    /// Unknown actions, including `SET DEFAULT`, degrade to NO ACTION.
    pub fn parse(s: &str) -> Self {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "CASCADE" => FkAction::Cascade,
            "SET NULL" => FkAction::SetNull,
            "RESTRICT" => FkAction::Restrict,
            _ => FkAction::NoAction,
        }
    }

    /// SQL keyword form.
    pub fn as_sql(&self) -> &'static str {
        match self {
            FkAction::Cascade => "CASCADE",
            FkAction::SetNull => "SET NULL",
            FkAction::Restrict => "RESTRICT",
            FkAction::NoAction => "NO ACTION",
        }
    }
}

/// Foreign key metadata. The owning table is the table whose
/// `foreign_keys` list contains this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_schema: String,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: FkAction,
    #[serde(default)]
    pub on_update: FkAction,
}

impl ForeignKey {
    /// Full name of the referenced table.
    pub fn ref_full_name(&self) -> String {
        format!("{}.{}", self.ref_schema, self.ref_table)
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub schema: String,
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Get the fully qualified table name (schema.table).
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether any column is an identity column.
    pub fn has_identity(&self) -> bool {
        self.columns.iter().any(|c| c.is_identity)
    }

    pub fn identity_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.is_identity).collect()
    }

    /// Full names of the tables this table references, excluding itself.
    pub fn depends_on(&self) -> Vec<String> {
        let own = self.full_name();
        let mut deps: Vec<String> = self
            .foreign_keys
            .iter()
            .map(|fk| fk.ref_full_name())
            .filter(|name| *name != own)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Check structural invariants: unique column names, and FK / PK / index
    /// columns that exist in this table.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(MigrateError::SchemaExtraction(format!(
                    "{}: duplicate column '{}'",
                    self.full_name(),
                    col.name
                )));
            }
        }

        let missing = |cols: &[String]| cols.iter().find(|c| !seen.contains(c.as_str())).cloned();

        if let Some(pk) = &self.primary_key {
            if let Some(c) = missing(pk) {
                return Err(MigrateError::SchemaExtraction(format!(
                    "{}: primary key column '{}' does not exist",
                    self.full_name(),
                    c
                )));
            }
        }
        for fk in &self.foreign_keys {
            if let Some(c) = missing(&fk.columns) {
                return Err(MigrateError::SchemaExtraction(format!(
                    "{}: foreign key {} uses unknown column '{}'",
                    self.full_name(),
                    fk.name,
                    c
                )));
            }
            if fk.columns.len() != fk.ref_columns.len() {
                return Err(MigrateError::SchemaExtraction(format!(
                    "{}: foreign key {} has {} columns but references {}",
                    self.full_name(),
                    fk.name,
                    fk.columns.len(),
                    fk.ref_columns.len()
                )));
            }
        }
        for idx in &self.indexes {
            if let Some(c) = missing(&idx.columns) {
                return Err(MigrateError::SchemaExtraction(format!(
                    "{}: index {} uses unknown column '{}'",
                    self.full_name(),
                    idx.name,
                    c
                )));
            }
        }
        Ok(())
    }
}

/// Split `schema.table` into its parts. A bare name gets `default_schema`.
pub fn split_full_name<'a>(full: &'a str, default_schema: &'a str) -> (&'a str, &'a str) {
    match full.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => (default_schema, full),
    }
}
