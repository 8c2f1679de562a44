//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL syntax strategy for PostgreSQL
//! - [`PostgresProvider`]: provider over tokio-postgres and deadpool-postgres

mod dialect;
mod provider;

pub use dialect::PostgresDialect;
pub use provider::PostgresProvider;
