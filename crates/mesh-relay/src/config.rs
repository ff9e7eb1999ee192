//! Relay configuration loading

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Relay server configuration. Every field has a default, so an empty JSON
/// object (or no file at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Only WebSocket upgrades on this path are accepted
    #[serde(default = "default_path")]
    pub path: String,

    /// Origins allowed to open a relay connection
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: BTreeSet<String>,

    /// Largest accepted text frame, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/connector".to_string()
}

fn default_allowed_origins() -> BTreeSet<String> {
    ["http://127.0.0.1:8080", "http://localhost:8080"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            allowed_origins: default_allowed_origins(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file, or use defaults if it doesn't exist
    pub fn load(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
        let config: RelayConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", config_file))?;
        tracing::info!("Loaded configuration from {:?}", config_file);
        Ok(config)
    }

    /// Check if an upgrade request's origin may connect
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.contains(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig::load(&dir.path().join("relay.json")).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.path, "/connector");
        assert!(config.is_origin_allowed("http://localhost:8080"));
        assert!(!config.is_origin_allowed("http://evil.example"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("relay.json");
        std::fs::write(
            &file,
            r#"{"listen": "127.0.0.1:9000", "allowed_origins": ["https://mesh.example"]}"#,
        )
        .unwrap();

        let config = RelayConfig::load(&file).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert!(config.is_origin_allowed("https://mesh.example"));
        assert!(!config.is_origin_allowed("http://localhost:8080"));
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_broken_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("relay.json");
        std::fs::write(&file, "{not json").unwrap();
        assert!(RelayConfig::load(&file).is_err());
    }
}
