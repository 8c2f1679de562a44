//! # xdb-transfer
//!
//! Cross-database export/import engine.
//!
//! Tables are exported from any supported database into a directory of
//! self-describing binary batch files plus a JSON manifest, and imported
//! from that directory into any supported database:
//!
//! - **Providers** for SQL Server, PostgreSQL and MySQL behind one contract
//! - **Batch codec** with automatic gzip/bzip2 detection and fail-closed decoding
//! - **Dependency ordering** from foreign keys, with cycles broken by deferral
//! - **Transactional batches** with bounded retry of transient failures
//! - **Diagnostics** for individual files and whole export directories
//!
//! ## Example
//!
//! ```rust,no_run
//! use xdb_transfer::{tracing_sink, Config, Exporter};
//!
//! #[tokio::main]
//! async fn main() -> xdb_transfer::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let source = config.require_source()?;
//!     let settings = source.settings(tracing_sink());
//!     let provider = source.kind()?.connect(&source.connection_string, &settings).await?;
//!     let result = Exporter::new(provider, config.export_options()).run().await?;
//!     println!("Exported {} rows: {}", result.total_rows, result.status.label());
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod drivers;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod manifest;
pub mod outcome;
pub mod resolver;
pub mod retry;

// Re-exports for convenient access
pub use codec::{decode_batch, encode_batch, Codec, Compression, CompressionMode, CompressionOptions, DecodeError};
pub use config::{Config, EndpointConfig, ExportConfig, ImportConfig, RetryConfig};
pub use core::{Column, ForeignKey, Index, LogicalType, Provider, ReadOptions, Row, SqlValue, Table};
pub use diagnostics::{validate_export, validate_file, DiagnosticResult, ExportValidation};
pub use drivers::{MemoryProvider, ProviderKind, SslMode};
pub use error::{MigrateError, Result};
pub use export::{ExportOptions, ExportResult, Exporter};
pub use import::{ImportOptions, ImportResult, Importer, UnappliedConstraint};
pub use logging::{tracing_sink, LogSink, SharedSink};
pub use manifest::ExportManifest;
pub use outcome::{RunStatus, TableOutcome, TableStatus};
pub use resolver::{resolve, ResolvedOrder};
pub use retry::RetryPolicy;
