//! Core abstractions shared by the export and import engines.
//!
//! - [`schema`]: Table, column, index and foreign key metadata
//! - [`value`]: SQL value representation and row batches
//! - [`traits`]: The provider capability contract and SQL dialect strategy
//! - [`identifier`]: Identifier and SQL fragment validation

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{split_full_name, Column, FkAction, ForeignKey, Index, LogicalType, Table};
pub use traits::{table_matches, Dialect, Provider, ProviderSettings, ReadOptions};
pub use value::{Batch, Row, SqlValue};
