//! Configuration file support for WalkUnlock.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/walkunlock/config.toml`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub enforcement: EnforcementConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How often a running service checks the data directory for edits
    /// made by other processes
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

impl DataConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

/// Enforcement loop configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Identifier of the WalkUnlock app itself; never tracked.
    #[serde(default = "default_host_app_id")]
    pub host_app_id: String,

    /// Seconds between billing ticks. Billing is always in whole minutes.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            host_app_id: default_host_app_id(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

impl EnforcementConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    base.join("walkunlock")
}

fn default_watch_interval_ms() -> u64 {
    500
}

fn default_host_app_id() -> String {
    "com.nathanprazeres.walkunlock".into()
}

fn default_tick_interval_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let secs = self.enforcement.tick_interval_secs;
        if !(1..=60).contains(&secs) {
            return Err(Error::Config(format!(
                "tick_interval_secs must be between 1 and 60, got {}",
                secs
            )));
        }
        let watch_ms = self.data.watch_interval_ms;
        if !(10..=60_000).contains(&watch_ms) {
            return Err(Error::Config(format!(
                "watch_interval_ms must be between 10 and 60000, got {}",
                watch_ms
            )));
        }
        if self.enforcement.host_app_id.trim().is_empty() {
            return Err(Error::Config("host_app_id must not be empty".into()));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        base.join("walkunlock").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.enforcement.tick_interval_secs, 10);
        assert_eq!(
            config.enforcement.host_app_id,
            "com.nathanprazeres.walkunlock"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[enforcement]
tick_interval_secs = 30
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.enforcement.tick_interval(), Duration::from_secs(30));
        assert_eq!(
            config.enforcement.host_app_id,
            "com.nathanprazeres.walkunlock"
        ); // default
    }

    #[test]
    fn test_tick_interval_out_of_range_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[enforcement]\ntick_interval_secs = 0\n").unwrap();

        match Config::load_from(&path) {
            Err(Error::Config(msg)) => assert!(msg.contains("tick_interval_secs")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_watch_interval() {
        let config: Config = toml::from_str("[data]\nwatch_interval_ms = 250\n").unwrap();
        assert_eq!(config.data.watch_interval(), Duration::from_millis(250));
        assert!(config.validate().is_ok());

        let config: Config = toml::from_str("[data]\nwatch_interval_ms = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load_from() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.enforcement.host_app_id = "org.example.host".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.enforcement.host_app_id, "org.example.host");
        assert_eq!(loaded.data.data_dir, config.data.data_dir);
    }
}
