//! MSSQL SQL dialect (Strategy pattern).
//!
//! Provides SQL Server identifier quoting, type mapping, identity handling
//! and parameter placeholders.

use crate::core::identifier::quote_with;
use crate::core::schema::{Column, LogicalType, Table};
use crate::core::traits::{Dialect, ReadOptions};

/// Largest `nvarchar(n)` before falling back to `nvarchar(max)`.
const MAX_NVARCHAR: u32 = 4000;
/// Largest `varchar(n)` / `varbinary(n)`.
const MAX_VARCHAR: u32 = 8000;

/// Microsoft SQL Server dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    /// Create a new MSSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &str {
        "mssql"
    }

    fn default_schema(&self) -> &str {
        "dbo"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_with(name, '[', ']')
    }

    fn native_type(&self, ty: &LogicalType) -> String {
        match ty {
            LogicalType::Boolean => "bit".into(),
            LogicalType::TinyInt => "tinyint".into(),
            LogicalType::SmallInt => "smallint".into(),
            LogicalType::Int => "int".into(),
            LogicalType::BigInt => "bigint".into(),
            LogicalType::Real => "real".into(),
            LogicalType::Double => "float".into(),
            LogicalType::Decimal { precision, scale } => {
                let p = (*precision).clamp(1, 38);
                format!("decimal({},{})", p, (*scale).min(p))
            }
            LogicalType::String {
                max_length: Some(n),
                unicode: true,
            } if *n > 0 && *n <= MAX_NVARCHAR => format!("nvarchar({})", n),
            LogicalType::String {
                max_length: Some(n),
                unicode: false,
            } if *n > 0 && *n <= MAX_VARCHAR => format!("varchar({})", n),
            LogicalType::String { unicode: false, .. } => "varchar(max)".into(),
            LogicalType::String { .. } => "nvarchar(max)".into(),
            LogicalType::Binary { max_length: Some(n) } if *n > 0 && *n <= MAX_VARCHAR => {
                format!("varbinary({})", n)
            }
            LogicalType::Binary { .. } => "varbinary(max)".into(),
            LogicalType::Date => "date".into(),
            LogicalType::Time => "time(7)".into(),
            LogicalType::DateTime => "datetime2(7)".into(),
            LogicalType::DateTimeOffset => "datetimeoffset(7)".into(),
            LogicalType::Guid => "uniqueidentifier".into(),
            LogicalType::Other { name } if name.eq_ignore_ascii_case("xml") => "xml".into(),
            LogicalType::Other { .. } => "nvarchar(max)".into(),
        }
    }

    fn logical_type(&self, native: &str, max_length: i32, precision: i32, scale: i32) -> LogicalType {
        let length = (max_length > 0).then_some(max_length as u32);
        match native.to_lowercase().as_str() {
            "bit" => LogicalType::Boolean,
            "tinyint" => LogicalType::TinyInt,
            "smallint" => LogicalType::SmallInt,
            "int" => LogicalType::Int,
            "bigint" => LogicalType::BigInt,
            "real" => LogicalType::Real,
            "float" => LogicalType::Double,
            "decimal" | "numeric" => LogicalType::Decimal {
                precision: precision.clamp(1, 38) as u8,
                scale: scale.clamp(0, 38) as u8,
            },
            "money" => LogicalType::Decimal {
                precision: 19,
                scale: 4,
            },
            "smallmoney" => LogicalType::Decimal {
                precision: 10,
                scale: 4,
            },
            "char" | "varchar" => LogicalType::String {
                max_length: length,
                unicode: false,
            },
            "text" => LogicalType::String {
                max_length: None,
                unicode: false,
            },
            "nchar" | "nvarchar" => LogicalType::String {
                max_length: length,
                unicode: true,
            },
            "ntext" => LogicalType::text(),
            "binary" | "varbinary" => LogicalType::Binary { max_length: length },
            "image" | "timestamp" | "rowversion" => LogicalType::Binary { max_length: None },
            "date" => LogicalType::Date,
            "time" => LogicalType::Time,
            "datetime" | "datetime2" | "smalldatetime" => LogicalType::DateTime,
            "datetimeoffset" => LogicalType::DateTimeOffset,
            "uniqueidentifier" => LogicalType::Guid,
            other => LogicalType::Other {
                name: other.to_string(),
            },
        }
    }

    fn identity_clause(&self, _col: &Column) -> String {
        "IDENTITY(1,1)".into()
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn identity_insert_sql(&self, table: &Table, enable: bool) -> Option<String> {
        Some(format!(
            "SET IDENTITY_INSERT {} {}",
            self.qualify(&table.schema, &table.name),
            if enable { "ON" } else { "OFF" }
        ))
    }

    fn select_sql(&self, opts: &ReadOptions) -> String {
        let cols = if opts.columns.is_empty() {
            "*".to_string()
        } else {
            self.quote_list(&opts.column_names())
        };
        let mut sql = format!(
            "SELECT {} FROM {} WITH (NOLOCK)",
            cols,
            self.qualify(&opts.schema, &opts.table)
        );
        if let Some(filter) = opts.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            sql.push_str(&format!(" WHERE ({})", filter));
        }
        if !opts.order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.quote_list(&opts.order_by)));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{FkAction, ForeignKey, Index};

    fn orders() -> Table {
        let mut t = Table::new("dbo", "Orders");
        t.columns = vec![
            Column::new("Id", LogicalType::Int, 1).not_null().identity(),
            Column::new("CustomerId", LogicalType::Int, 2).not_null(),
            Column::new("Note", LogicalType::varchar(200), 3),
        ];
        t.primary_key = Some(vec!["Id".into()]);
        t
    }

    #[test]
    fn test_quote_ident() {
        let dialect = MssqlDialect::new();
        assert_eq!(dialect.quote_ident("name"), "[name]");
        assert_eq!(dialect.quote_ident("table]name"), "[table]]name]");
        assert_eq!(dialect.qualify("dbo", "Users"), "[dbo].[Users]");
    }

    #[test]
    fn test_param_placeholder() {
        let dialect = MssqlDialect::new();
        assert_eq!(dialect.param_placeholder(1), "@P1");
        assert_eq!(dialect.param_placeholder(10), "@P10");
    }

    #[test]
    fn test_native_types() {
        let d = MssqlDialect::new();
        assert_eq!(d.native_type(&LogicalType::varchar(100)), "nvarchar(100)");
        assert_eq!(d.native_type(&LogicalType::varchar(5000)), "nvarchar(max)");
        assert_eq!(
            d.native_type(&LogicalType::String {
                max_length: Some(5000),
                unicode: false
            }),
            "varchar(5000)"
        );
        assert_eq!(d.native_type(&LogicalType::Guid), "uniqueidentifier");
        assert_eq!(
            d.native_type(&LogicalType::Other {
                name: "geography".into()
            }),
            "nvarchar(max)"
        );
    }

    #[test]
    fn test_logical_types() {
        let d = MssqlDialect::new();
        assert_eq!(d.logical_type("NVARCHAR", -1, 0, 0), LogicalType::text());
        assert_eq!(d.logical_type("nvarchar", 50, 0, 0), LogicalType::varchar(50));
        assert_eq!(
            d.logical_type("money", 8, 19, 4),
            LogicalType::Decimal {
                precision: 19,
                scale: 4
            }
        );
        assert_eq!(d.logical_type("datetime2", 8, 27, 7), LogicalType::DateTime);
        assert_eq!(
            d.logical_type("hierarchyid", 892, 0, 0),
            LogicalType::Other {
                name: "hierarchyid".into()
            }
        );
    }

    #[test]
    fn test_create_table_sql() {
        let sql = MssqlDialect::new().create_table_sql(&orders());
        assert!(sql.starts_with("CREATE TABLE [dbo].[Orders] ("));
        assert!(sql.contains("[Id] int IDENTITY(1,1) NOT NULL"));
        assert!(sql.contains("[Note] nvarchar(200) NULL"));
        assert!(sql.contains("CONSTRAINT [PK_dbo_Orders] PRIMARY KEY ([Id])"));
    }

    #[test]
    fn test_index_and_fk_sql() {
        let d = MssqlDialect::new();
        let t = orders();
        let idx = Index {
            name: "IX_Orders_Customer".into(),
            columns: vec!["CustomerId".into()],
            is_unique: false,
        };
        assert_eq!(
            d.create_index_sql(&t, &idx),
            "CREATE INDEX [IX_Orders_Customer] ON [dbo].[Orders] ([CustomerId])"
        );
        let fk = ForeignKey {
            name: "FK_Orders_Customers".into(),
            columns: vec!["CustomerId".into()],
            ref_schema: "dbo".into(),
            ref_table: "Customers".into(),
            ref_columns: vec!["Id".into()],
            on_delete: FkAction::Cascade,
            on_update: FkAction::NoAction,
        };
        let sql = d.add_foreign_key_sql(&t, &fk);
        assert!(sql.starts_with("ALTER TABLE [dbo].[Orders] ADD CONSTRAINT [FK_Orders_Customers]"));
        assert!(sql.contains("REFERENCES [dbo].[Customers] ([Id])"));
        assert!(sql.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn test_identity_insert_and_select() {
        let d = MssqlDialect::new();
        let t = orders();
        assert_eq!(
            d.identity_insert_sql(&t, true).unwrap(),
            "SET IDENTITY_INSERT [dbo].[Orders] ON"
        );
        let opts = ReadOptions::for_table(&t, 100).with_filter(Some("[Id] > 5".into()));
        assert_eq!(
            d.select_sql(&opts),
            "SELECT [Id], [CustomerId], [Note] FROM [dbo].[Orders] WITH (NOLOCK) WHERE ([Id] > 5) ORDER BY [Id]"
        );
        assert_eq!(
            d.insert_sql(&t, &["Id".into(), "Note".into()], 2),
            "INSERT INTO [dbo].[Orders] ([Id], [Note]) VALUES (@P1, @P2), (@P3, @P4)"
        );
    }
}
