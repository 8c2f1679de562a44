//! MySQL/MariaDB SQL dialect (Strategy pattern).
//!
//! MySQL has no schemas below the database; the database name plays the
//! schema role in qualified names.

use crate::core::identifier::quote_with;
use crate::core::schema::{Column, LogicalType};
use crate::core::traits::Dialect;

/// MySQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    /// Create a new MySQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn default_schema(&self) -> &str {
        ""
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_with(name, '`', '`')
    }

    fn qualify(&self, schema: &str, table: &str) -> String {
        if schema.is_empty() {
            self.quote_ident(table)
        } else {
            format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
        }
    }

    fn native_type(&self, ty: &LogicalType) -> String {
        match ty {
            LogicalType::Boolean => "tinyint(1)".into(),
            LogicalType::TinyInt => "tinyint unsigned".into(),
            LogicalType::SmallInt => "smallint".into(),
            LogicalType::Int => "int".into(),
            LogicalType::BigInt => "bigint".into(),
            LogicalType::Real => "float".into(),
            LogicalType::Double => "double".into(),
            LogicalType::Decimal { precision, scale } => {
                let p = (*precision).clamp(1, 65);
                format!("decimal({},{})", p, (*scale).min(30).min(p))
            }
            LogicalType::String {
                max_length: Some(n),
                ..
            } if *n > 0 && *n <= 16_383 => format!("varchar({})", n),
            LogicalType::String { .. } => "longtext".into(),
            LogicalType::Binary { max_length: Some(n) } if *n > 0 && *n <= 65_535 => {
                format!("varbinary({})", n)
            }
            LogicalType::Binary { .. } => "longblob".into(),
            LogicalType::Date => "date".into(),
            LogicalType::Time => "time(6)".into(),
            // Offsets are not representable; values are stored as UTC.
            LogicalType::DateTime | LogicalType::DateTimeOffset => "datetime(6)".into(),
            LogicalType::Guid => "char(36)".into(),
            LogicalType::Other { .. } => "longtext".into(),
        }
    }

    /// `native` is the full `COLUMN_TYPE`, e.g. `tinyint(1)` or `int unsigned`.
    fn logical_type(&self, native: &str, max_length: i32, precision: i32, scale: i32) -> LogicalType {
        let native = native.to_lowercase();
        let base = native
            .split(|c: char| c == '(' || c == ' ')
            .next()
            .unwrap_or_default();
        let unsigned = native.contains("unsigned");
        let length = (max_length > 0).then_some(max_length as u32);
        match base {
            "tinyint" if native.starts_with("tinyint(1)") => LogicalType::Boolean,
            "bit" if max_length <= 1 => LogicalType::Boolean,
            "tinyint" if unsigned => LogicalType::TinyInt,
            "tinyint" | "smallint" if !unsigned => LogicalType::SmallInt,
            "smallint" | "mediumint" => LogicalType::Int,
            "int" | "integer" if !unsigned => LogicalType::Int,
            "int" | "integer" | "bigint" => LogicalType::BigInt,
            "float" => LogicalType::Real,
            "double" | "real" => LogicalType::Double,
            "decimal" | "numeric" => LogicalType::Decimal {
                precision: precision.clamp(1, 38) as u8,
                scale: scale.clamp(0, 38) as u8,
            },
            "char" | "varchar" => LogicalType::String {
                max_length: length,
                unicode: true,
            },
            "tinytext" | "text" | "mediumtext" | "longtext" => LogicalType::text(),
            "binary" | "varbinary" => LogicalType::Binary { max_length: length },
            "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                LogicalType::Binary { max_length: None }
            }
            "date" => LogicalType::Date,
            "time" => LogicalType::Time,
            "datetime" | "timestamp" => LogicalType::DateTime,
            _ => LogicalType::Other {
                name: base.to_string(),
            },
        }
    }

    fn identity_clause(&self, _col: &Column) -> String {
        "AUTO_INCREMENT".into()
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
}
