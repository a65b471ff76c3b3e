//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use driver::{DeviceMatch, DeviceTable, DriverConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::usb::TransportConfig;

/// Longest interface prefix that still leaves room for the kernel's index
pub const MAX_INTERFACE_PREFIX_LEN: usize = 12;

/// Largest frame header the receive buffer must hold on top of the MTU
const MAX_FRAME_OVERHEAD: usize = 14 + 4 + driver::framing::RNDIS_PACKET_HEADER_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    /// Interface matches added to the builtin CDC Ethernet and RNDIS entries
    ///
    /// # Example Configuration
    /// ```toml
    /// [[devices]]
    /// class = 0xe0      # wireless controller
    /// subclass = 0x01
    /// protocol = 0x03   # RNDIS over Bluetooth-class descriptors
    /// framing = "rndis"
    /// ```
    #[serde(default)]
    pub devices: Vec<DeviceMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
    #[serde(default)]
    pub service_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Size of the buffer kept armed on each bulk-in endpoint
    #[serde(default = "DriverSettings::default_rx_buffer_size")]
    pub rx_buffer_size: usize,
    /// Total bytes the frame pool may lease out at once
    #[serde(default = "DriverSettings::default_pool_budget")]
    pub pool_budget_bytes: usize,
    /// How long shutdown waits for cancelled transfers
    #[serde(default = "DriverSettings::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Depth of the driver command and event queues
    #[serde(default = "DriverSettings::default_command_queue")]
    pub command_queue: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            rx_buffer_size: Self::default_rx_buffer_size(),
            pool_budget_bytes: Self::default_pool_budget(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
            command_queue: Self::default_command_queue(),
        }
    }
}

impl DriverSettings {
    fn default_rx_buffer_size() -> usize {
        driver::receive::DEFAULT_RX_BUFFER_SIZE
    }

    fn default_pool_budget() -> usize {
        driver::pool::DEFAULT_POOL_BUDGET
    }

    fn default_drain_timeout_ms() -> u64 {
        5000
    }

    fn default_command_queue() -> usize {
        driver::channel::DEFAULT_QUEUE_CAPACITY
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to bind ("0xVID:0xPID", `*` matches anything); empty binds all
    #[serde(default)]
    pub filters: Vec<String>,
    /// Bulk-in poll interval; bounds how long a cancel takes to be observed
    #[serde(default = "UsbSettings::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Bulk-out timeout, surfaced as a failed transmit
    #[serde(default = "UsbSettings::default_tx_timeout_ms")]
    pub tx_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            tx_timeout_ms: Self::default_tx_timeout_ms(),
        }
    }
}

impl UsbSettings {
    fn default_poll_timeout_ms() -> u64 {
        100
    }

    fn default_tx_timeout_ms() -> u64 {
        1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// TAP interfaces are named `<prefix><n>`
    #[serde(default = "NetworkSettings::default_interface_prefix")]
    pub interface_prefix: String,
    #[serde(default = "NetworkSettings::default_mtu")]
    pub mtu: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            interface_prefix: Self::default_interface_prefix(),
            mtu: Self::default_mtu(),
        }
    }
}

impl NetworkSettings {
    fn default_interface_prefix() -> String {
        "usbeth".to_string()
    }

    fn default_mtu() -> u32 {
        1500
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                log_level: "info".to_string(),
                service_mode: false,
            },
            driver: DriverSettings::default(),
            usb: UsbSettings::default(),
            network: NetworkSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-tether/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
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
            config_dir.join("usb-tether").join("daemon.toml")
        } else {
            PathBuf::from(".config/usb-tether/daemon.toml")
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            rx_buffer_size: self.driver.rx_buffer_size,
            drain_timeout: Duration::from_millis(self.driver.drain_timeout_ms),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            poll_timeout: Duration::from_millis(self.usb.poll_timeout_ms),
            tx_timeout: Duration::from_millis(self.usb.tx_timeout_ms),
        }
    }

    /// Builtin matches followed by the configured `[[devices]]`
    pub fn device_table(&self) -> DeviceTable {
        DeviceTable::with_extra(&self.devices)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        let driver = &self.driver;
        if driver.rx_buffer_size == 0 {
            return Err(anyhow!("driver.rx_buffer_size must be greater than 0"));
        }
        if driver.command_queue == 0 {
            return Err(anyhow!("driver.command_queue must be greater than 0"));
        }
        if driver.drain_timeout_ms == 0 {
            return Err(anyhow!("driver.drain_timeout_ms must be greater than 0"));
        }
        if driver.pool_budget_bytes < driver.rx_buffer_size {
            return Err(anyhow!(
                "driver.pool_budget_bytes ({}) cannot hold one receive buffer ({})",
                driver.pool_budget_bytes,
                driver.rx_buffer_size
            ));
        }

        if self.usb.poll_timeout_ms == 0 || self.usb.tx_timeout_ms == 0 {
            return Err(anyhow!("USB timeouts must be greater than 0"));
        }

        let prefix = &self.network.interface_prefix;
        if prefix.is_empty()
            || prefix.len() > MAX_INTERFACE_PREFIX_LEN
            || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(anyhow!(
                "Invalid interface prefix '{}', expected 1-{} ASCII letters, digits or '_'",
                prefix,
                MAX_INTERFACE_PREFIX_LEN
            ));
        }

        if !(68..=9000).contains(&self.network.mtu) {
            return Err(anyhow!(
                "Invalid MTU {}, must be between 68 and 9000",
                self.network.mtu
            ));
        }
        if driver.rx_buffer_size < self.network.mtu as usize + MAX_FRAME_OVERHEAD {
            tracing::warn!(
                "driver.rx_buffer_size {} is smaller than a full frame at MTU {}",
                driver.rx_buffer_size,
                self.network.mtu
            );
        }

        let mut seen = HashSet::new();
        for entry in &self.devices {
            if !seen.insert((entry.class, entry.subclass, entry.protocol)) {
                return Err(anyhow!(
                    "Duplicate device entry {:#04x}/{:#04x}/{:#04x}",
                    entry.class,
                    entry.subclass,
                    entry.protocol
                ));
            }
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::Framing;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.log_level, "info");
        assert!(!config.daemon.service_mode);
        assert_eq!(config.network.interface_prefix, "usbeth");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(DaemonConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(DaemonConfig::validate_filter("0x1234:*").is_ok());
        assert!(DaemonConfig::validate_filter("*:0x5678").is_ok());
        assert!(DaemonConfig::validate_filter("*:*").is_ok());
        assert!(DaemonConfig::validate_filter("0XABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(DaemonConfig::validate_filter("1234:5678").is_err());
        assert!(DaemonConfig::validate_filter("0x1234").is_err());
        assert!(DaemonConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(DaemonConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(DaemonConfig::validate_filter("0x12345:0x5678").is_err());
        assert!(DaemonConfig::validate_filter("0x:0x5678").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = DaemonConfig::default();
        config.daemon.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.daemon.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_sizes() {
        let mut config = DaemonConfig::default();
        config.driver.rx_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.driver.pool_budget_bytes = config.driver.rx_buffer_size - 1;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.usb.tx_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.network.mtu = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_interface_prefix() {
        let mut config = DaemonConfig::default();
        config.network.interface_prefix = "tether_".to_string();
        assert!(config.validate().is_ok());

        config.network.interface_prefix = String::new();
        assert!(config.validate().is_err());

        config.network.interface_prefix = "a-very-long-prefix".to_string();
        assert!(config.validate().is_err());

        config.network.interface_prefix = "eth%d".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_device_entries_rejected() {
        let mut config = DaemonConfig::default();
        let entry = DeviceMatch {
            class: 0xe0,
            subclass: 0x01,
            protocol: 0x03,
            framing: Framing::Rndis,
        };
        config.devices = vec![entry, entry];
        assert!(config.validate().is_err());

        config.devices.pop();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_table().entries().len(), 3);
    }

    #[test]
    fn test_derived_driver_and_transport_config() {
        let mut config = DaemonConfig::default();
        config.driver.drain_timeout_ms = 250;
        config.usb.poll_timeout_ms = 20;

        assert_eq!(
            config.driver_config().drain_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.transport_config().poll_timeout,
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = DaemonConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.daemon.log_level, parsed.daemon.log_level);
        assert_eq!(config.driver.rx_buffer_size, parsed.driver.rx_buffer_size);
        assert_eq!(config.network.mtu, parsed.network.mtu);
    }
}
