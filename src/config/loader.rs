//! Configuration Loader
//!
//! Loads connector configuration from TOML files or strings. Structural
//! validation happens separately in [`crate::config::validation`], after
//! the component registry is populated, so load and validate are two
//! explicit steps in `main`.

use std::fs;
use std::path::Path;

use crate::config::types::ConnectorConfig;

/// Load configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<ConnectorConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read '{}': {}", path.display(), e))?;
    let config: ConnectorConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("cannot parse '{}': {}", path.display(), e))?;
    Ok(config)
}

/// Load configuration from a TOML string; used by tests and embedded
/// setups.
pub fn load_config_from_string(content: &str) -> anyhow::Result<ConnectorConfig> {
    let config: ConnectorConfig = toml::from_str(content)?;
    Ok(config)
}
