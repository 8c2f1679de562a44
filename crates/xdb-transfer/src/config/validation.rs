//! Configuration validation.

use super::{Config, EndpointConfig, MAX_BATCH_SIZE};
use crate::core::identifier::validate_sql_fragment;
use crate::drivers::SslMode;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.is_none() && config.target.is_none() {
        return Err(MigrateError::Config(
            "at least one of source or target is required".into(),
        ));
    }
    if let Some(source) = &config.source {
        validate_endpoint("source", source)?;
    }
    if let Some(target) = &config.target {
        validate_endpoint("target", target)?;
    }

    validate_batch_size("export.batch_size", config.export.batch_size)?;
    validate_batch_size("import.batch_size", config.import.batch_size)?;

    for (table, filter) in &config.export.filters {
        let mut parts = table.split('.');
        let well_formed = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(s), Some(t), None) if !s.is_empty() && !t.is_empty()
        );
        if !well_formed {
            return Err(MigrateError::Config(format!(
                "export.filters key '{}' must be schema.table",
                table
            )));
        }
        validate_sql_fragment(&format!("export.filters[{}]", table), filter)?;
    }

    if let Some(schema) = &config.import.target_schema {
        if schema.trim().is_empty() {
            return Err(MigrateError::Config(
                "import.target_schema cannot be empty".into(),
            ));
        }
    }

    if config.retry.metadata_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "retry.metadata_timeout_secs must be at least 1".into(),
        ));
    }
    if config.retry.transfer_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "retry.transfer_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}

fn validate_endpoint(role: &str, endpoint: &EndpointConfig) -> Result<()> {
    endpoint
        .kind()
        .map_err(|e| MigrateError::Config(format!("{}.provider: {}", role, e)))?;
    if endpoint.connection_string.trim().is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.connection_string is required",
            role
        )));
    }
    SslMode::parse(&endpoint.ssl_mode)
        .map_err(|e| MigrateError::Config(format!("{}.ssl_mode: {}", role, e)))?;
    Ok(())
}

fn validate_batch_size(field: &str, value: Option<usize>) -> Result<()> {
    match value {
        Some(n) if n == 0 || n > MAX_BATCH_SIZE => Err(MigrateError::Config(format!(
            "{} must be between 1 and {}, got {}",
            field, MAX_BATCH_SIZE, n
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            source: Some(EndpointConfig {
                provider: "mssql".to_string(),
                connection_string: "Server=localhost;Database=src;User Id=sa;Password=pw".to_string(),
                ssl_mode: "require".to_string(),
                default_schema: None,
            }),
            target: Some(EndpointConfig {
                provider: "postgres".to_string(),
                connection_string: "host=localhost dbname=dst user=postgres".to_string(),
                ssl_mode: "disable".to_string(),
                default_schema: None,
            }),
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_requires_an_endpoint() {
        assert!(validate(&Config::default()).is_err());
    }

    #[test]
    fn test_empty_connection_string() {
        let mut config = valid_config();
        if let Some(source) = config.source.as_mut() {
            source.connection_string = "  ".to_string();
        }
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_provider() {
        let mut config = valid_config();
        if let Some(target) = config.target.as_mut() {
            target.provider = "oracle".to_string();
        }
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("target.provider"));
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut config = valid_config();
        config.export.batch_size = Some(0);
        assert!(validate(&config).is_err());
        config.export.batch_size = Some(MAX_BATCH_SIZE + 1);
        assert!(validate(&config).is_err());
        config.export.batch_size = Some(MAX_BATCH_SIZE);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_filter_key_must_be_qualified() {
        let mut config = valid_config();
        config
            .export
            .filters
            .insert("Orders".into(), "Id > 5".into());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_filter_fragment_screened() {
        let mut config = valid_config();
        config
            .export
            .filters
            .insert("dbo.Orders".into(), "1=1; DROP TABLE x".into());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = valid_config();
        config.retry.transfer_timeout_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_debug_redacts_connection_string() {
        let config = valid_config();
        let debug_output = format!("{:?}", config.source);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("Password=pw"));
    }
}
