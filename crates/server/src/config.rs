use std::path::Path;

use anyhow::{Context, Result};
use cloudplay_protocol::CloudplayConfig;

pub use cloudplay_protocol::{AllocatorConfig, ServerConfig, SignalingConfig};

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<CloudplayConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(CloudplayConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: CloudplayConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!(
        games = config.games.len(),
        "Loaded config from {}",
        path.display()
    );
    Ok(config)
}
