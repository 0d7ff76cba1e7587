// Configuration for the bluebridge CLI
//
// Stored as JSON in:
// - macOS: ~/Library/Application Support/bluebridge/config.json
// - Linux: ~/.config/bluebridge/config.json
// - Windows: %APPDATA%\bluebridge\config.json

use anyhow::{Context, Result};
use bluebridge_core::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings handed to the core when a session is opened
    #[serde(flatten)]
    pub bridge: BridgeConfig,

    /// Adapter to use, by identifier or address; first enumerated if unset
    pub adapter: Option<String>,

    /// How long `notify` listens before unsubscribing
    pub notify_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            adapter: None,
            notify_seconds: 5,
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("bluebridge");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .bridge
                .validate()
                .context("Invalid bridge settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Bridge settings with `BLUEBRIDGE_*` environment overrides applied
    pub fn effective_bridge(&self) -> BridgeConfig {
        self.bridge.clone().with_env_overrides()
    }

    /// Update one value in memory; callers persist with `save`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "library_name" => {
                updated.bridge.library_name = value.to_string();
            }
            "native_dir" => {
                updated.bridge.native_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "scan_duration_ms" => {
                updated.bridge.scan_duration_ms = value.parse().context("Invalid number")?;
            }
            "connect_timeout_ms" => {
                updated.bridge.connect_timeout_ms = value.parse().context("Invalid number")?;
            }
            "adapter" => {
                updated.adapter = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "notify_seconds" => {
                updated.notify_seconds = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.bridge.validate().context("Rejected config value")?;
        *self = updated;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "library_name" => Some(self.bridge.library_name.clone()),
            "native_dir" => self
                .bridge
                .native_dir
                .as_ref()
                .map(|p| p.display().to_string()),
            "scan_duration_ms" => Some(self.bridge.scan_duration_ms.to_string()),
            "connect_timeout_ms" => Some(self.bridge.connect_timeout_ms.to_string()),
            "adapter" => self.adapter.clone(),
            "notify_seconds" => Some(self.notify_seconds.to_string()),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("library_name".to_string(), self.bridge.library_name.clone()),
            (
                "native_dir".to_string(),
                self.bridge
                    .native_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "scan_duration_ms".to_string(),
                self.bridge.scan_duration_ms.to_string(),
            ),
            (
                "connect_timeout_ms".to_string(),
                self.bridge.connect_timeout_ms.to_string(),
            ),
            (
                "adapter".to_string(),
                self.adapter.clone().unwrap_or_else(|| "(first)".to_string()),
            ),
            ("notify_seconds".to_string(), format!("{}s", self.notify_seconds)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bridge.library_name, "simplecble");
        assert_eq!(config.notify_seconds, 5);
        assert!(config.adapter.is_none());
    }

    #[test]
    fn test_bridge_settings_are_flattened() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(json["library_name"], "simplecble");
        assert_eq!(json["scan_duration_ms"], 5000);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_set_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("adapter", "hci1").unwrap();
        config.set("scan_duration_ms", "1500").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.get("adapter").as_deref(), Some("hci1"));
        assert_eq!(reloaded.bridge.scan_duration_ms, 1500);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("scan_duration_ms", "soon").is_err());
        assert!(config.set("scan_duration_ms", "0").is_err());
        assert!(config.set("listen_port", "80").is_err());
    }
}
