//! Host configuration management

use crate::echo::RelayConfig;
use anyhow::{Context, Result, anyhow};
use protocol::{AccessoryStrings, DeviceFilter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest relay buffer accepted from configuration
pub const MAX_BUFFER_SIZE: usize = 65536;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub watch: WatchSettings,
    /// Identification strings sent during negotiation
    #[serde(default)]
    pub accessory: AccessoryStrings,
    #[serde(default)]
    pub negotiation: NegotiationSettings,
    #[serde(default)]
    pub relay: RelaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Hotplug filters, in `0xVID:0xPID` form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Devices to negotiate into accessory mode; every match is negotiated
    #[serde(default = "WatchSettings::default_switchable")]
    pub switchable: String,
    /// Devices already in accessory mode; every match is relayed as is
    #[serde(default = "WatchSettings::default_accessory")]
    pub accessory: String,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            switchable: Self::default_switchable(),
            accessory: Self::default_accessory(),
        }
    }
}

impl WatchSettings {
    fn default_switchable() -> String {
        "0x04e8:0x6860".to_string()
    }

    fn default_accessory() -> String {
        "0x18d1:0x2d01".to_string()
    }

    pub fn switchable_filter(&self) -> Result<DeviceFilter> {
        self.switchable
            .parse()
            .with_context(|| format!("Invalid switchable filter '{}'", self.switchable))
    }

    pub fn accessory_filter(&self) -> Result<DeviceFilter> {
        self.accessory
            .parse()
            .with_context(|| format!("Invalid accessory filter '{}'", self.accessory))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSettings {
    #[serde(default = "NegotiationSettings::default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    /// Reset and close a switchable device after the handshake
    #[serde(default = "NegotiationSettings::default_reset")]
    pub reset_after_negotiation: bool,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            control_timeout_ms: Self::default_control_timeout_ms(),
            reset_after_negotiation: Self::default_reset(),
        }
    }
}

impl NegotiationSettings {
    fn default_control_timeout_ms() -> u64 {
        5000
    }

    fn default_reset() -> bool {
        true
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "RelaySettings::default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "RelaySettings::default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            io_timeout_ms: Self::default_io_timeout_ms(),
            buffer_size: Self::default_buffer_size(),
        }
    }
}

impl RelaySettings {
    fn default_io_timeout_ms() -> u64 {
        3000
    }

    fn default_buffer_size() -> usize {
        512
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            buffer_size: self.buffer_size,
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/aoa-echo/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("aoa-echo").join("host.toml")
        } else {
            PathBuf::from(".config/aoa-echo/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        self.watch.switchable_filter()?;
        self.watch.accessory_filter()?;

        self.accessory
            .validate()
            .context("Invalid accessory identification string")?;

        if self.negotiation.control_timeout_ms == 0 {
            return Err(anyhow!("control_timeout_ms must be greater than zero"));
        }

        if self.relay.io_timeout_ms == 0 {
            return Err(anyhow!("io_timeout_ms must be greater than zero"));
        }

        if !(1..=MAX_BUFFER_SIZE).contains(&self.relay.buffer_size) {
            return Err(anyhow!(
                "Invalid buffer_size {}, must be between 1 and {}",
                self.relay.buffer_size,
                MAX_BUFFER_SIZE
            ));
        }

        Ok(())
    }
}

/// Load a configuration file given on the command line (`~` is expanded)
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{PRODUCT_ID_ACCESSORY_ADB, VENDOR_ID_GOOGLE};

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.accessory.manufacturer, "ReyRey");
        assert!(config.negotiation.reset_after_negotiation);
        assert_eq!(config.relay.buffer_size, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_filters() {
        let watch = WatchSettings::default();
        assert_eq!(
            watch.accessory_filter().unwrap(),
            DeviceFilter::exact(VENDOR_ID_GOOGLE, PRODUCT_ID_ACCESSORY_ADB)
        );
        assert!(watch.switchable_filter().unwrap().matches(0x04e8, 0x6860));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            [relay]
            buffer_size = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.buffer_size, 1024);
        assert_eq!(config.relay.io_timeout_ms, 3000);
        assert_eq!(config.watch.switchable, "0x04e8:0x6860");
        assert_eq!(
            config.relay.relay_config().io_timeout,
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HostConfig::default();
        config.host.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.watch.accessory = "18d1:2d01".to_string();
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.accessory.model = "Galaxy\u{e9}".to_string();
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.relay.buffer_size = 0;
        assert!(config.validate().is_err());
        config.relay.buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = HostConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HostConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.host.log_level, parsed.host.log_level);
        assert_eq!(config.accessory, parsed.accessory);
        assert_eq!(config.watch.accessory, parsed.watch.accessory);
    }
}
