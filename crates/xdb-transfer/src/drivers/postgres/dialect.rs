//! PostgreSQL SQL dialect (Strategy pattern).

use crate::core::identifier::quote_with;
use crate::core::schema::{Column, LogicalType};
use crate::core::traits::Dialect;

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Create a new PostgreSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn default_schema(&self) -> &str {
        "public"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_with(name, '"', '"')
    }

    fn native_type(&self, ty: &LogicalType) -> String {
        match ty {
            LogicalType::Boolean => "boolean".into(),
            LogicalType::TinyInt | LogicalType::SmallInt => "smallint".into(),
            LogicalType::Int => "integer".into(),
            LogicalType::BigInt => "bigint".into(),
            LogicalType::Real => "real".into(),
            LogicalType::Double => "double precision".into(),
            LogicalType::Decimal { precision, scale } => {
                let p = (*precision).max(1);
                format!("numeric({},{})", p, (*scale).min(p))
            }
            LogicalType::String {
                max_length: Some(n),
                ..
            } if *n > 0 && *n <= 10_485_760 => format!("varchar({})", n),
            LogicalType::String { .. } => "text".into(),
            LogicalType::Binary { .. } => "bytea".into(),
            LogicalType::Date => "date".into(),
            LogicalType::Time => "time".into(),
            LogicalType::DateTime => "timestamp".into(),
            LogicalType::DateTimeOffset => "timestamptz".into(),
            LogicalType::Guid => "uuid".into(),
            LogicalType::Other { .. } => "text".into(),
        }
    }

    fn logical_type(&self, native: &str, max_length: i32, precision: i32, scale: i32) -> LogicalType {
        let length = (max_length > 0).then_some(max_length as u32);
        match native.to_lowercase().as_str() {
            "boolean" | "bool" => LogicalType::Boolean,
            "smallint" | "int2" => LogicalType::SmallInt,
            "integer" | "int" | "int4" | "serial" => LogicalType::Int,
            "bigint" | "int8" | "bigserial" => LogicalType::BigInt,
            "real" | "float4" => LogicalType::Real,
            "double precision" | "float8" => LogicalType::Double,
            "numeric" | "decimal" if precision > 0 => LogicalType::Decimal {
                precision: precision.min(38) as u8,
                scale: scale.clamp(0, 38) as u8,
            },
            // Unconstrained numeric.
            "numeric" | "decimal" => LogicalType::Decimal {
                precision: 38,
                scale: 10,
            },
            "character varying" | "varchar" | "character" | "char" | "bpchar" => {
                LogicalType::String {
                    max_length: length,
                    unicode: true,
                }
            }
            "text" | "citext" => LogicalType::text(),
            "bytea" => LogicalType::Binary { max_length: None },
            "date" => LogicalType::Date,
            "time" | "time without time zone" => LogicalType::Time,
            "timestamp" | "timestamp without time zone" => LogicalType::DateTime,
            "timestamptz" | "timestamp with time zone" => LogicalType::DateTimeOffset,
            "uuid" => LogicalType::Guid,
            other => LogicalType::Other {
                name: other.to_string(),
            },
        }
    }

    fn identity_clause(&self, _col: &Column) -> String {
        "GENERATED BY DEFAULT AS IDENTITY".into()
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }
}
