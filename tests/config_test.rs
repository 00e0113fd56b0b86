//! Integration tests for configuration loading

use parcel_sorter::infra::{Config, DeviceMode};
use parcel_sorter::services::ChuteRules;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[site]
id = "hub-a-line-2"

[correlation]
min_lag_ms = 150
max_lag_ms = 1800
exception_chute = 42
binding_retention_ms = 5000

[device]
mode = "serial"
serial_device = "/dev/ttyS3"
serial_baud = 57600
write_timeout_ms = 250

[dispatch]
workers = 4
queue_size = 64

[acquisition]
listen_port = 26000

[rules]
default_chute = 7

[rules.exact]
"ABC123" = 3

[[rules.prefix]]
prefix = "SF"
chute = 8

[sink]
decisions_file = "/tmp/decisions.jsonl"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "hub-a-line-2");
    assert_eq!(config.min_lag_ms(), 150);
    assert_eq!(config.max_lag_ms(), 1800);
    assert_eq!(config.exception_chute(), 42);
    assert_eq!(config.binding_retention_ms(), 5000);
    assert_eq!(config.device_mode(), DeviceMode::Serial);
    assert_eq!(config.device_serial_path(), "/dev/ttyS3");
    assert_eq!(config.device_serial_baud(), 57600);
    assert_eq!(config.device_write_timeout_ms(), 250);
    assert_eq!(config.dispatch_workers(), 4);
    assert_eq!(config.dispatch_queue_size(), 64);
    assert_eq!(config.acquisition_port(), 26000);
    assert_eq!(config.decisions_file(), "/tmp/decisions.jsonl");
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.prometheus_port(), 9091);
    assert_eq!(config.exact_rules().get("ABC123"), Some(&3));
    assert_eq!(config.exact_rules().len(), 1);
    assert_eq!(config.default_chute(), Some(7));

    let settings = config.correlation_settings();
    assert_eq!(settings.rules.chute_for("ABC123"), Some(3));
    assert_eq!(settings.rules.chute_for("SF1001"), Some(8));
    assert_eq!(settings.rules.chute_for("UNKNOWN"), Some(7));
}

#[test]
fn test_optional_sections_use_defaults() {
    let temp_file = write_config(
        r#"
[correlation]
min_lag_ms = -200
max_lag_ms = 2000
exception_chute = 99

[device]
mode = "tcp"
tcp_addr = "10.0.0.5:4001"
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "sorter");
    assert_eq!(config.device_tcp_addr(), "10.0.0.5:4001");
    assert_eq!(config.dispatch_workers(), 2);
    assert!(config.acquisition_enabled());
    assert_eq!(config.acquisition_port(), 25900);
    assert_eq!(config.noread_sentinels().len(), 3);

    let settings = config.correlation_settings();
    assert_eq!(settings.late_signal_grace(), Some(Duration::from_millis(200)));
    assert!(settings.rules.is_empty());
    assert_eq!(settings.rules.chute_for("ANY"), None);

    let device = config.device_settings();
    assert_eq!(device.mode, DeviceMode::Tcp);
    assert_eq!(device.connect_timeout, Duration::from_millis(3000));
}

#[test]
fn test_inverted_window_is_rejected() {
    let temp_file = write_config(
        r#"
[correlation]
min_lag_ms = 2500
max_lag_ms = 2000
exception_chute = 99

[device]
mode = "tcp"
"#,
    );

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("min_lag_ms 2500 > max_lag_ms 2000"));
}

#[test]
fn test_missing_correlation_section_is_rejected() {
    let temp_file = write_config(
        r#"
[device]
mode = "tcp"
"#,
    );

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.min_lag_ms(), 100);
    assert_eq!(config.max_lag_ms(), 2000);
    assert_eq!(config.exception_chute(), 99);
    assert_eq!(config.device_mode(), DeviceMode::Tcp);
}

#[test]
fn test_dev_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml");
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.device_tcp_addr(), "127.0.0.1:4001");
    assert_eq!(config.correlation_settings().rules.chute_for("PKG000001"), Some(5));
}
