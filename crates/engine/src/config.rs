//! Engine configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    /// Short packet tolerance per endpoint type
    #[serde(default)]
    pub short_packet: ShortPacketPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub log_level: String,
    /// Name given to each device's I/O thread
    #[serde(default = "EngineSettings::default_io_thread_name")]
    pub io_thread_name: String,
    /// How long close() waits for discarded requests to be reaped
    #[serde(default = "EngineSettings::default_close_drain_timeout")]
    pub close_drain_timeout_ms: u64,
}

impl EngineSettings {
    fn default_io_thread_name() -> String {
        "usbfs-io".to_string()
    }

    fn default_close_drain_timeout() -> u64 {
        1000
    }

    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }
}

/// Whether a transfer that moved fewer bytes than requested counts as
/// `Completed` (tolerated) or `ShortPacket`
///
/// Only bulk and interrupt endpoints consult this; control transfers always
/// tolerate short data stages and isochronous packets report their own
/// lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortPacketPolicy {
    #[serde(default = "ShortPacketPolicy::default_bulk")]
    pub bulk: bool,
    #[serde(default)]
    pub interrupt: bool,
}

impl ShortPacketPolicy {
    fn default_bulk() -> bool {
        true
    }
}

impl Default for ShortPacketPolicy {
    fn default() -> Self {
        Self {
            bulk: Self::default_bulk(),
            interrupt: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: EngineSettings {
                log_level: "info".to_string(),
                io_thread_name: EngineSettings::default_io_thread_name(),
                close_drain_timeout_ms: EngineSettings::default_close_drain_timeout(),
            },
            short_packet: ShortPacketPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbfs-engine/engine.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbfs-engine").join("engine.toml")
        } else {
            PathBuf::from(".config/usbfs-engine/engine.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.engine.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.engine.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.engine.io_thread_name.is_empty() {
            return Err(anyhow!("io_thread_name must not be empty"));
        }

        if self.engine.close_drain_timeout_ms == 0 {
            return Err(anyhow!("close_drain_timeout_ms must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.engine.io_thread_name, "usbfs-io");
        assert_eq!(config.engine.close_drain_timeout(), Duration::from_secs(1));
        assert!(config.short_packet.bulk);
        assert!(!config.short_packet.interrupt);
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.engine.log_level, parsed.engine.log_level);
        assert_eq!(config.short_packet, parsed.short_packet);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [engine]
            log_level = "debug"

            [short_packet]
            interrupt = true
            "#,
        )
        .unwrap();

        assert_eq!(parsed.engine.io_thread_name, "usbfs-io");
        assert_eq!(parsed.engine.close_drain_timeout_ms, 1000);
        assert!(parsed.short_packet.bulk);
        assert!(parsed.short_packet.interrupt);
    }

    #[test]
    fn test_validate() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.engine.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.engine.log_level = "debug".to_string();
        config.engine.close_drain_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let mut config = EngineConfig::default();
        config.engine.io_thread_name = "bench-io".to_string();
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.engine.io_thread_name, "bench-io");
    }
}
