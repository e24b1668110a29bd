//! Configuration loading and management

use std::path::Path;

use anyhow::{Context, Result};
use casefile_core::cipher::KdfParams;
use casefile_core::sync_engine::DEFAULT_PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Main configuration for the daemon, stored as `config.json` in the data directory.
///
/// Secrets never live here: the organisation secret and the bearer token come
/// from the command line or the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the server API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Organisation whose data this installation holds (learned at first login)
    #[serde(default)]
    pub organisation_id: Option<String>,

    /// Seconds between passes in `watch` mode
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Records requested per delta page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Organisation key derivation cost
    #[serde(default)]
    pub kdf: KdfParams,
}

fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_sync_interval() -> u64 {
    60
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            organisation_id: None,
            sync_interval_secs: default_sync_interval(),
            page_size: default_page_size(),
            kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Load configuration from the data directory, writing defaults if absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_file = data_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();
            config.save(data_dir)?;
            tracing::info!("Created default config at {:?}", config_file);
            Ok(config)
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
        let config_file = data_dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_file, content)
            .with_context(|| format!("Failed to write config: {:?}", config_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_writes_defaults() {
        let dir = TempDir::new().unwrap();

        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.json").exists());
        assert_eq!(Config::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "api_url": "https://api.example.org", "page_size": 50 }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.api_url, "https://api.example.org");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.kdf, KdfParams::default());
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ nope").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
