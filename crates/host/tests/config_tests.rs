//! Integration tests for configuration parsing
//!
//! Tests host configuration loading, including:
//! - Full and minimal files
//! - Save/load round trip through the filesystem
//! - Invalid configuration handling
//! - Conversion into host options

use host::config::{self, HostConfig};
use host::HostOptions;
use std::time::Duration;
use tempfile::tempdir;

const FULL_HOST_CONFIG: &str = r#"
[host]
log_level = "debug"

[watch]
switchable = "0x04e8:*"
accessory = "0x18d1:0x2d00"

[accessory]
manufacturer = "Acme"
model = "Echo Probe"
description = "Loopback test accessory"
version = "2.1"
uri = "https://example.com/echo"
serial = "0001"

[negotiation]
control_timeout_ms = 1000
reset_after_negotiation = false

[relay]
io_timeout_ms = 250
buffer_size = 16384
"#;

#[test]
fn test_full_config_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.toml");
    std::fs::write(&path, FULL_HOST_CONFIG).unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.host.log_level, "debug");
    assert_eq!(config.accessory.model, "Echo Probe");
    assert!(!config.negotiation.reset_after_negotiation);

    let options = HostOptions::from_config(&config).unwrap();
    assert!(options.switchable.matches(0x04e8, 0x1234));
    assert!(!options.accessory.matches(0x18d1, 0x2d01));
    assert_eq!(options.control_timeout, Duration::from_millis(1000));
    assert_eq!(options.relay.io_timeout, Duration::from_millis(250));
    assert_eq!(options.relay.buffer_size, 16384);
}

#[test]
fn test_minimal_config_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.toml");
    std::fs::write(&path, "[host]\nlog_level = \"warn\"\n").unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.host.log_level, "warn");
    assert_eq!(config.accessory.manufacturer, "ReyRey");
    assert_eq!(config.relay.buffer_size, 512);
    assert_eq!(config.negotiation.control_timeout_ms, 5000);
}

#[test]
fn test_save_and_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.relay.io_timeout_ms = 1500;
    config.save(&path).unwrap();

    let loaded = config::load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.relay.io_timeout_ms, 1500);
    assert_eq!(loaded.accessory, config.accessory);
}

#[test]
fn test_invalid_files_are_rejected() {
    let dir = tempdir().unwrap();

    let cases = [
        ("bad_level.toml", "[host]\nlog_level = \"loud\"\n"),
        ("bad_filter.toml", "[watch]\naccessory = \"18d1:2d00\"\n"),
        ("bad_string.toml", "[accessory]\nmanufacturer = \"Caf\u{e9}\"\nmodel = \"m\"\ndescription = \"d\"\nversion = \"v\"\nuri = \"u\"\nserial = \"s\"\n"),
        ("bad_buffer.toml", "[relay]\nbuffer_size = 0\n"),
        ("bad_toml.toml", "[relay\n"),
    ];

    for (name, content) in cases {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        assert!(HostConfig::load(Some(path)).is_err(), "{} should fail", name);
    }
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    assert!(HostConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
