//! Firebird dialect.
//!
//! Firebird is a DDL and type-mapping target only: scripts can be emitted in
//! its dialect, but connecting reports a configuration error.

mod dialect;

pub use dialect::FirebirdDialect;
