use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};
use serde::de::DeserializeOwned;

use crate::config::models::GatewayConfig;

/// Load the gateway configuration from a file using the config crate.
/// Supports YAML, JSON and TOML, chosen by extension.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    load_file(Path::new(config_path))
}

/// Deserialize any configuration document from `path`.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    // Determine file format based on extension
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))
}
