//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use crate::export::ExportOptions;
use crate::import::ImportOptions;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA-256 fingerprint of the configuration, for log correlation.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn require_source(&self) -> Result<&EndpointConfig> {
        self.source
            .as_ref()
            .ok_or_else(|| MigrateError::Config("source is required for export".into()))
    }

    pub fn require_target(&self) -> Result<&EndpointConfig> {
        self.target
            .as_ref()
            .ok_or_else(|| MigrateError::Config("target is required for import".into()))
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            output_dir: self.export.output_dir.clone(),
            tables: self.export.tables.clone(),
            batch_size: self.export.get_batch_size(),
            filters: self.export.filters.clone(),
            compression: self.export.compression_options(),
            emit_scripts: self.export.emit_scripts,
            emit_table_metadata: self.export.emit_table_metadata,
            retry: self.retry.policy(),
        }
    }

    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            input_dir: self.import.input_dir.clone(),
            tables: self.import.tables.clone(),
            batch_size: self.import.get_batch_size(),
            create_schema: self.import.create_schema,
            create_foreign_keys: self.import.create_foreign_keys,
            continue_on_error: self.import.continue_on_error,
            verify_checksums: self.import.verify_checksums,
            target_schema: self.import.target_schema.clone(),
            retry: self.retry.policy(),
        }
    }
}
