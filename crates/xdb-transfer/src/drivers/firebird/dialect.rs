//! Firebird SQL dialect (Strategy pattern).
//!
//! Firebird has no schemas; qualified names drop the schema part.

use crate::core::identifier::quote_with;
use crate::core::schema::{Column, LogicalType};
use crate::core::traits::Dialect;

const MAX_VARCHAR: u32 = 32_765;

/// Firebird 3+ dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct FirebirdDialect;

impl FirebirdDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for FirebirdDialect {
    fn name(&self) -> &str {
        "firebird"
    }

    fn default_schema(&self) -> &str {
        ""
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_with(name, '"', '"')
    }

    fn qualify(&self, _schema: &str, table: &str) -> String {
        self.quote_ident(table)
    }

    fn native_type(&self, ty: &LogicalType) -> String {
        match ty {
            LogicalType::Boolean => "BOOLEAN".into(),
            LogicalType::TinyInt | LogicalType::SmallInt => "SMALLINT".into(),
            LogicalType::Int => "INTEGER".into(),
            LogicalType::BigInt => "BIGINT".into(),
            LogicalType::Real => "FLOAT".into(),
            LogicalType::Double => "DOUBLE PRECISION".into(),
            LogicalType::Decimal { precision, scale } => {
                let p = (*precision).clamp(1, 18);
                format!("DECIMAL({},{})", p, (*scale).min(p))
            }
            LogicalType::String {
                max_length: Some(n),
                ..
            } if *n > 0 && *n <= MAX_VARCHAR => format!("VARCHAR({})", n),
            LogicalType::String { .. } | LogicalType::Other { .. } => "BLOB SUB_TYPE TEXT".into(),
            LogicalType::Binary { .. } => "BLOB SUB_TYPE BINARY".into(),
            LogicalType::Date => "DATE".into(),
            LogicalType::Time => "TIME".into(),
            LogicalType::DateTime => "TIMESTAMP".into(),
            LogicalType::DateTimeOffset => "TIMESTAMP WITH TIME ZONE".into(),
            LogicalType::Guid => "CHAR(36)".into(),
        }
    }

    fn logical_type(&self, native: &str, max_length: i32, precision: i32, scale: i32) -> LogicalType {
        let length = (max_length > 0).then_some(max_length as u32);
        match native.trim().to_uppercase().as_str() {
            "BOOLEAN" => LogicalType::Boolean,
            "SMALLINT" => LogicalType::SmallInt,
            "INTEGER" => LogicalType::Int,
            "BIGINT" | "INT64" => LogicalType::BigInt,
            "FLOAT" => LogicalType::Real,
            "DOUBLE PRECISION" | "DOUBLE" => LogicalType::Double,
            "DECIMAL" | "NUMERIC" => LogicalType::Decimal {
                precision: precision.clamp(1, 38) as u8,
                scale: scale.clamp(0, 38) as u8,
            },
            "VARCHAR" | "CHAR" | "VARYING" | "TEXT" => LogicalType::String {
                max_length: length,
                unicode: true,
            },
            "BLOB SUB_TYPE TEXT" => LogicalType::text(),
            "BLOB" | "BLOB SUB_TYPE BINARY" => LogicalType::Binary { max_length: None },
            "DATE" => LogicalType::Date,
            "TIME" => LogicalType::Time,
            "TIMESTAMP" => LogicalType::DateTime,
            "TIMESTAMP WITH TIME ZONE" => LogicalType::DateTimeOffset,
            other => LogicalType::Other {
                name: other.to_lowercase(),
            },
        }
    }

    fn identity_clause(&self, _col: &Column) -> String {
        "GENERATED BY DEFAULT AS IDENTITY".into()
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Table;

    #[test]
    fn test_qualify_drops_schema() {
        let d = FirebirdDialect::new();
        assert_eq!(d.qualify("dbo", "ORDERS"), "\"ORDERS\"");
    }

    #[test]
    fn test_create_table_sql() {
        let d = FirebirdDialect::new();
        let mut t = Table::new("dbo", "Notes");
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).not_null().identity(),
            Column::new("Body", LogicalType::text(), 2),
        ];
        t.primary_key = Some(vec!["Id".into()]);
        let sql = d.create_table_sql(&t);
        assert!(sql.starts_with("CREATE TABLE \"Notes\" ("));
        assert!(sql.contains("\"Id\" INTEGER GENERATED BY DEFAULT AS IDENTITY NOT NULL"));
        assert!(sql.contains("\"Body\" BLOB SUB_TYPE TEXT NULL"));
    }

    #[test]
    fn test_logical_types() {
        let d = FirebirdDialect::new();
        assert_eq!(d.logical_type("varchar", 30, 0, 0), LogicalType::varchar(30));
        assert_eq!(d.logical_type("BLOB SUB_TYPE TEXT", 0, 0, 0), LogicalType::text());
        assert_eq!(
            d.logical_type("DECIMAL", 0, 18, 4),
            LogicalType::Decimal {
                precision: 18,
                scale: 4
            }
        );
    }
}
