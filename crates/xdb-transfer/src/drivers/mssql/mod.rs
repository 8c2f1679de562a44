//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: SQL syntax strategy for MSSQL
//! - [`MssqlProvider`]: live provider over tiberius and bb8

mod dialect;
mod provider;

pub use dialect::MssqlDialect;
pub use provider::{MssqlProvider, TiberiusConnectionManager};
