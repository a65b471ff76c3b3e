//! Integration tests for configuration parsing
//!
//! Covers the on-disk configuration:
//! - Minimal and full documents
//! - Extra device table entries
//! - Save and reload through the filesystem
//! - Invalid configuration handling

use common::InterfaceDescriptor;
use daemon::config::DaemonConfig;
use driver::Framing;
use std::time::Duration;

const MINIMAL_CONFIG: &str = r#"
[daemon]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
[daemon]
log_level = "debug"
service_mode = true

[driver]
rx_buffer_size = 4096
pool_budget_bytes = 1048576
drain_timeout_ms = 2000
command_queue = 64

[usb]
filters = ["0x18d1:*", "0x0525:0xa4a2"]
poll_timeout_ms = 50
tx_timeout_ms = 500

[network]
interface_prefix = "tether"
mtu = 1400

[[devices]]
class = 0xe0
subclass = 0x01
protocol = 0x03
framing = "rndis"

[[devices]]
class = 0xff
subclass = 0x42
protocol = 0x00
framing = "ecm"
"#;

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_minimal_config_uses_defaults() {
    let config = DaemonConfig::from_toml(MINIMAL_CONFIG).unwrap();
    let defaults = DaemonConfig::default();

    assert_eq!(config.daemon.log_level, "info");
    assert!(!config.daemon.service_mode);
    assert_eq!(config.driver.rx_buffer_size, defaults.driver.rx_buffer_size);
    assert_eq!(config.driver.drain_timeout_ms, 5000);
    assert_eq!(config.usb.poll_timeout_ms, 100);
    assert_eq!(config.usb.tx_timeout_ms, 1000);
    assert!(config.usb.filters.is_empty());
    assert_eq!(config.network.interface_prefix, "usbeth");
    assert_eq!(config.network.mtu, 1500);
    assert!(config.devices.is_empty());
}

#[test]
fn test_full_config() {
    let config = DaemonConfig::from_toml(FULL_CONFIG).unwrap();

    assert_eq!(config.daemon.log_level, "debug");
    assert!(config.daemon.service_mode);
    assert_eq!(config.driver.rx_buffer_size, 4096);
    assert_eq!(config.driver.pool_budget_bytes, 1_048_576);
    assert_eq!(config.driver.command_queue, 64);
    assert_eq!(config.usb.filters.len(), 2);
    assert_eq!(config.network.interface_prefix, "tether");
    assert_eq!(config.network.mtu, 1400);
    assert_eq!(config.devices.len(), 2);
    assert_eq!(config.devices[0].framing, Framing::Rndis);

    let driver = config.driver_config();
    assert_eq!(driver.rx_buffer_size, 4096);
    assert_eq!(driver.drain_timeout, Duration::from_secs(2));

    let transport = config.transport_config();
    assert_eq!(transport.poll_timeout, Duration::from_millis(50));
    assert_eq!(transport.tx_timeout, Duration::from_millis(500));
}

#[test]
fn test_extra_devices_extend_builtin_table() {
    let config = DaemonConfig::from_toml(FULL_CONFIG).unwrap();
    let table = config.device_table();

    let wireless = InterfaceDescriptor {
        number: 0,
        class: 0xe0,
        subclass: 0x01,
        protocol: 0x03,
        endpoints: vec![],
    };
    let ecm = InterfaceDescriptor {
        number: 0,
        class: 0x02,
        subclass: 0x06,
        protocol: 0x00,
        endpoints: vec![],
    };

    assert_eq!(table.lookup(&wireless).unwrap().framing, Framing::Rndis);
    assert_eq!(table.lookup(&ecm).unwrap().framing, Framing::Ecm);
}

// ============================================================================
// Invalid documents
// ============================================================================

#[test]
fn test_missing_daemon_section_rejected() {
    assert!(DaemonConfig::from_toml("[network]\nmtu = 1500\n").is_err());
}

#[test]
fn test_invalid_values_rejected() {
    let cases = [
        "[daemon]\nlog_level = \"loud\"\n",
        "[daemon]\nlog_level = \"info\"\n[usb]\nfilters = [\"18d1\"]\n",
        "[daemon]\nlog_level = \"info\"\n[network]\nmtu = 20\n",
        "[daemon]\nlog_level = \"info\"\n[network]\ninterface_prefix = \"usb-eth\"\n",
        "[daemon]\nlog_level = \"info\"\n[driver]\nrx_buffer_size = 4096\npool_budget_bytes = 1024\n",
        "[daemon]\nlog_level = \"info\"\n[usb]\ntx_timeout_ms = 0\n",
    ];

    for case in cases {
        assert!(DaemonConfig::from_toml(case).is_err(), "accepted: {}", case);
    }
}

#[test]
fn test_unknown_framing_rejected() {
    let content = r#"
[daemon]
log_level = "info"

[[devices]]
class = 0xff
subclass = 0x01
protocol = 0x00
framing = "ncm"
"#;
    assert!(DaemonConfig::from_toml(content).is_err());
}

// ============================================================================
// Filesystem
// ============================================================================

#[test]
fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("daemon.toml");

    let mut config = DaemonConfig::from_toml(FULL_CONFIG).unwrap();
    config.network.mtu = 1280;
    config.save(&path).unwrap();
    assert!(path.exists());

    let loaded = DaemonConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.network.mtu, 1280);
    assert_eq!(loaded.usb.filters, config.usb.filters);
    assert_eq!(loaded.devices, config.devices);
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(DaemonConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_load_invalid_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.toml");
    std::fs::write(&path, "[daemon]\nlog_level = \"verbose\"\n").unwrap();

    let err = DaemonConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Invalid config file"));
}
