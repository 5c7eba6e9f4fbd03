/// Configuration loading from JSON files
use crate::config::types::{DiscoveryError, Result, SandboxConfig};
use std::path::Path;

/// File name looked up by [`load_default`].
pub const DEFAULT_CONFIG_FILE: &str = "addrprobe.json";

/// Parse a configuration; absent fields take their defaults.
pub fn from_json_str(content: &str) -> Result<SandboxConfig> {
    serde_json::from_str(content)
        .map_err(|e| DiscoveryError::Config(format!("Failed to parse config JSON: {}", e)))
}

/// Load configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SandboxConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        DiscoveryError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let config = from_json_str(&content)?;
    log::debug!("Loaded sandbox config from {}", path.display());
    Ok(config)
}

/// Load `./addrprobe.json` if present, the built-in defaults otherwise.
pub fn load_default() -> Result<SandboxConfig> {
    let path = std::env::current_dir()
        .map_err(|e| DiscoveryError::Config(format!("Failed to get current directory: {}", e)))?
        .join(DEFAULT_CONFIG_FILE);

    if !path.exists() {
        return Ok(SandboxConfig::default());
    }
    load_config(path)
}
