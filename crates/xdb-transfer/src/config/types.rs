//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, CompressionMode, CompressionOptions};
use crate::core::traits::ProviderSettings;
use crate::drivers::ProviderKind;
use crate::error::Result;
use crate::logging::SharedSink;
use crate::retry::RetryPolicy;

/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: usize = 1_000_000;

/// Default rows per batch file and per insert transaction.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database read by `export`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EndpointConfig>,

    /// Database written by `import`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EndpointConfig>,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub import: ImportConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// One database endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Engine name: `mssql`, `postgres`, `mysql` or `firebird`.
    pub provider: String,

    /// Engine-native connection string. Never defaulted.
    pub connection_string: String,

    /// TLS mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Schema assumed for bare table names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("provider", &self.provider)
            .field("connection_string", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("default_schema", &self.default_schema)
            .finish()
    }
}

impl EndpointConfig {
    pub fn kind(&self) -> Result<ProviderKind> {
        ProviderKind::parse(&self.provider)
    }

    /// Construction options for the provider, with `log` bound as its sink.
    pub fn settings(&self, log: SharedSink) -> ProviderSettings {
        ProviderSettings {
            log,
            ssl_mode: self.ssl_mode.clone(),
            default_schema: self.default_schema.clone(),
        }
    }
}

/// Export behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_dir")]
    pub output_dir: PathBuf,

    /// Tables to export (`schema.table` or bare name). Empty exports all.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Rows per batch file (default: 100000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Row filters keyed by `schema.table`, in the source dialect.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,

    #[serde(default)]
    pub compression: CompressionMode,

    #[serde(default)]
    pub compression_codec: Codec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_threshold_bytes: Option<usize>,

    /// Write `scripts/*.sql` (default: true).
    #[serde(default = "default_true")]
    pub emit_scripts: bool,

    /// Write `table_metadata/*.json` (default: true).
    #[serde(default = "default_true")]
    pub emit_table_metadata: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_dir(),
            tables: Vec::new(),
            batch_size: None,
            filters: BTreeMap::new(),
            compression: CompressionMode::default(),
            compression_codec: Codec::default(),
            compression_threshold_bytes: None,
            emit_scripts: true,
            emit_table_metadata: true,
        }
    }
}

impl ExportConfig {
    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn get_compression_threshold(&self) -> usize {
        self.compression_threshold_bytes
            .unwrap_or_else(|| CompressionOptions::default().threshold_bytes)
    }

    pub fn compression_options(&self) -> CompressionOptions {
        CompressionOptions {
            mode: self.compression,
            codec: self.compression_codec,
            threshold_bytes: self.get_compression_threshold(),
        }
    }
}

/// Import behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_dir")]
    pub input_dir: PathBuf,

    /// Subset of manifest tables to import. Empty imports all.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Rows per insert transaction (default: 100000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Create tables and indexes before loading (default: true).
    #[serde(default = "default_true")]
    pub create_schema: bool,

    /// Add foreign keys (default: true).
    #[serde(default = "default_true")]
    pub create_foreign_keys: bool,

    /// Record a failing table and move on instead of aborting (default: false).
    #[serde(default)]
    pub continue_on_error: bool,

    /// Check data file SHA-256 against the manifest before decoding (default: true).
    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    /// Load every table into this schema instead of its exported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            input_dir: default_dir(),
            tables: Vec::new(),
            batch_size: None,
            create_schema: true,
            create_foreign_keys: true,
            continue_on_error: false,
            verify_checksums: true,
            target_schema: None,
        }
    }
}

impl ImportConfig {
    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }
}

/// Retry and timeout tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Ceiling for catalog queries and DDL.
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,

    /// Ceiling for one batch read or write.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            metadata_timeout_secs: default_metadata_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            metadata_timeout: Duration::from_secs(self.metadata_timeout_secs),
            transfer_timeout: Duration::from_secs(self.transfer_timeout_secs),
        }
    }
}

// Default value functions for serde
fn default_dir() -> PathBuf {
    PathBuf::from("./export")
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_metadata_timeout() -> u64 {
    30
}

fn default_transfer_timeout() -> u64 {
    600
}
