//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.timeouts.response_secs, 600);
        assert_eq!(config.limits.max_connections, 10_000);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            hostname = "localhost"
            port = 9000

            [http2]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 9000);
        assert!(!config.http2.enabled);
        assert!(config.http2.push);
        assert!(config.shutdown.sigterm);
    }
}
