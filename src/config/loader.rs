use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{
    models::{EnvironmentConfig, GatewayConfig},
    validation::{ConfigError, ServerConfigValidator},
};

/// Environment variable that overrides the configured listen port.
pub const PORT_ENV_VAR: &str = "PORT";

/// Load and validate the settings of `environment` from a configuration
/// file. Supports JSON, YAML and TOML.
pub async fn load_config(config_path: &str, environment: &str) -> Result<EnvironmentConfig> {
    let config = load_config_unchecked(config_path, environment).await?;
    ServerConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration without validation (used for validation command)
pub async fn load_config_unchecked(config_path: &str, environment: &str) -> Result<EnvironmentConfig> {
    let port_override = std::env::var(PORT_ENV_VAR).ok();
    load_config_sync(config_path, environment, port_override)
}

/// Load configuration synchronously
pub fn load_config_sync(
    config_path: &str,
    environment: &str,
    port_override: Option<String>,
) -> Result<EnvironmentConfig> {
    let path = Path::new(config_path);

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            file_format(path),
        ))
        .set_override_option(format!("{environment}.port"), port_override)
        .with_context(|| format!("Invalid {PORT_ENV_VAR} override"))?
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let mut all: GatewayConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    if all.is_empty() {
        return Err(ConfigError::Empty.into());
    }

    all.remove(environment)
        .ok_or_else(|| ConfigError::EnvironmentNotFound(environment.to_string()).into())
}

/// Determine file format based on extension; JSON when unknown.
fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Json,
    }
}
