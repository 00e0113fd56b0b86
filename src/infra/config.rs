//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Correlation settings (lag window, exception chute, rules) are reloadable at
//! runtime; they are published as an immutable `CorrelationSettings` snapshot
//! so in-flight correlations keep the values they started with.

use crate::services::rules::RuleTable;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Tcp,
    Serial,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Tcp => "tcp",
            DeviceMode::Serial => "serial",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    pub min_lag_ms: i64,
    pub max_lag_ms: i64,
    pub exception_chute: u8,
    #[serde(default = "default_noread_sentinels")]
    pub noread_sentinels: Vec<String>,
    #[serde(default = "default_binding_retention_ms")]
    pub binding_retention_ms: u64,
}

fn default_noread_sentinels() -> Vec<String> {
    vec!["NOREAD".to_string(), "NO_READ".to_string(), "?".to_string()]
}

fn default_binding_retention_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub mode: DeviceMode,
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,
    #[serde(default = "default_serial_device")]
    pub serial_device: String,
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_tcp_addr() -> String {
    "192.168.1.50:4001".to_string()
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_serial_baud() -> u32 {
    115_200
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    500
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_workers")]
    pub workers: usize,
    #[serde(default = "default_dispatch_queue_size")]
    pub queue_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: default_dispatch_workers(), queue_size: default_dispatch_queue_size() }
    }
}

fn default_dispatch_workers() -> usize {
    2
}

fn default_dispatch_queue_size() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    /// Enable the parcel event TCP listener
    #[serde(default = "default_acquisition_enabled")]
    pub enabled: bool,
    #[serde(default = "default_acquisition_port")]
    pub listen_port: u16,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self { enabled: default_acquisition_enabled(), listen_port: default_acquisition_port() }
    }
}

fn default_acquisition_enabled() -> bool {
    true
}

fn default_acquisition_port() -> u16 {
    25900
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefixRule {
    pub prefix: String,
    pub chute: u8,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RulesConfig {
    /// Exact barcode to chute mapping
    #[serde(default)]
    pub exact: HashMap<String, u8>,
    /// Prefix rules, evaluated in file order
    #[serde(default)]
    pub prefix: Vec<PrefixRule>,
    /// Chute for barcodes no rule matches (None routes to the exception chute)
    #[serde(default)]
    pub default_chute: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// File path for the decision log (JSONL format)
    #[serde(default = "default_decisions_file")]
    pub decisions_file: String,
    #[serde(default = "default_sink_queue_size")]
    pub queue_size: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { decisions_file: default_decisions_file(), queue_size: default_sink_queue_size() }
    }
}

fn default_decisions_file() -> String {
    "decisions.jsonl".to_string()
}

fn default_sink_queue_size() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, prometheus_port: default_prometheus_port() }
    }
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Sorter line identifier (e.g., "hub-a-line-1")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "sorter".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub correlation: CorrelationConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Immutable snapshot of the reloadable correlation settings
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationSettings {
    pub min_lag_ms: i64,
    pub max_lag_ms: i64,
    pub exception_chute: u8,
    pub noread_sentinels: Vec<String>,
    pub binding_retention_ms: u64,
    pub rules: RuleTable,
}

impl CorrelationSettings {
    /// Timeout applied to a newly admitted signal
    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.max_lag_ms.max(0) as u64)
    }

    /// How long a parcel waits for a signal that may arrive after it
    pub fn late_signal_grace(&self) -> Option<Duration> {
        (self.min_lag_ms < 0).then(|| Duration::from_millis(self.min_lag_ms.unsigned_abs()))
    }

    /// Whether a signed lag lies inside the inclusive window
    #[inline]
    pub fn in_window(&self, lag_ms: i64) -> bool {
        self.min_lag_ms <= lag_ms && lag_ms <= self.max_lag_ms
    }

    /// Whether a barcode is empty or a recognised no-read marker
    pub fn is_noread(&self, barcode: &str) -> bool {
        let trimmed = barcode.trim();
        trimmed.is_empty() || self.noread_sentinels.iter().any(|s| s.eq_ignore_ascii_case(trimmed))
    }
}

/// Device connection parameters, applied on the next (re)connect
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub mode: DeviceMode,
    pub tcp_addr: String,
    pub serial_device: String,
    pub serial_baud: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_delay: Duration,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    min_lag_ms: i64,
    max_lag_ms: i64,
    exception_chute: u8,
    noread_sentinels: Vec<String>,
    binding_retention_ms: u64,
    device_mode: DeviceMode,
    device_tcp_addr: String,
    device_serial_path: String,
    device_serial_baud: u32,
    device_connect_timeout_ms: u64,
    device_read_timeout_ms: u64,
    device_write_timeout_ms: u64,
    device_reconnect_delay_ms: u64,
    dispatch_workers: usize,
    dispatch_queue_size: usize,
    acquisition_enabled: bool,
    acquisition_port: u16,
    exact_rules: HashMap<String, u8>,
    prefix_rules: Vec<(String, u8)>,
    default_chute: Option<u8>,
    decisions_file: String,
    sink_queue_size: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: "sorter".to_string(),
            min_lag_ms: 100,
            max_lag_ms: 2000,
            exception_chute: 99,
            noread_sentinels: default_noread_sentinels(),
            binding_retention_ms: default_binding_retention_ms(),
            device_mode: DeviceMode::Tcp,
            device_tcp_addr: default_tcp_addr(),
            device_serial_path: default_serial_device(),
            device_serial_baud: default_serial_baud(),
            device_connect_timeout_ms: default_connect_timeout_ms(),
            device_read_timeout_ms: default_read_timeout_ms(),
            device_write_timeout_ms: default_write_timeout_ms(),
            device_reconnect_delay_ms: default_reconnect_delay_ms(),
            dispatch_workers: default_dispatch_workers(),
            dispatch_queue_size: default_dispatch_queue_size(),
            acquisition_enabled: true,
            acquisition_port: default_acquisition_port(),
            exact_rules: HashMap::new(),
            prefix_rules: Vec::new(),
            default_chute: None,
            decisions_file: default_decisions_file(),
            sink_queue_size: default_sink_queue_size(),
            metrics_interval_secs: 10,
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let correlation = toml_config.correlation;
        if correlation.min_lag_ms > correlation.max_lag_ms {
            anyhow::bail!(
                "Invalid correlation window in {}: min_lag_ms {} > max_lag_ms {}",
                path.display(),
                correlation.min_lag_ms,
                correlation.max_lag_ms
            );
        }

        Ok(Self {
            site_id: toml_config.site.id,
            min_lag_ms: correlation.min_lag_ms,
            max_lag_ms: correlation.max_lag_ms,
            exception_chute: correlation.exception_chute,
            noread_sentinels: correlation.noread_sentinels,
            binding_retention_ms: correlation.binding_retention_ms,
            device_mode: toml_config.device.mode,
            device_tcp_addr: toml_config.device.tcp_addr,
            device_serial_path: toml_config.device.serial_device,
            device_serial_baud: toml_config.device.serial_baud,
            device_connect_timeout_ms: toml_config.device.connect_timeout_ms,
            device_read_timeout_ms: toml_config.device.read_timeout_ms,
            device_write_timeout_ms: toml_config.device.write_timeout_ms,
            device_reconnect_delay_ms: toml_config.device.reconnect_delay_ms,
            dispatch_workers: toml_config.dispatch.workers.max(1),
            dispatch_queue_size: toml_config.dispatch.queue_size.max(1),
            acquisition_enabled: toml_config.acquisition.enabled,
            acquisition_port: toml_config.acquisition.listen_port,
            exact_rules: toml_config.rules.exact,
            prefix_rules: toml_config
                .rules
                .prefix
                .into_iter()
                .map(|rule| (rule.prefix, rule.chute))
                .collect(),
            default_chute: toml_config.rules.default_chute,
            decisions_file: toml_config.sink.decisions_file,
            sink_queue_size: toml_config.sink.queue_size.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from the path given in args or environment
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Snapshot of the settings the correlation path reads per signal/parcel
    pub fn correlation_settings(&self) -> Arc<CorrelationSettings> {
        Arc::new(CorrelationSettings {
            min_lag_ms: self.min_lag_ms,
            max_lag_ms: self.max_lag_ms,
            exception_chute: self.exception_chute,
            noread_sentinels: self.noread_sentinels.clone(),
            binding_retention_ms: self.binding_retention_ms,
            rules: RuleTable::new(
                self.exact_rules.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                self.prefix_rules.clone(),
                self.default_chute,
            ),
        })
    }

    /// Snapshot of the device connection parameters
    pub fn device_settings(&self) -> Arc<DeviceSettings> {
        Arc::new(DeviceSettings {
            mode: self.device_mode,
            tcp_addr: self.device_tcp_addr.clone(),
            serial_device: self.device_serial_path.clone(),
            serial_baud: self.device_serial_baud,
            connect_timeout: Duration::from_millis(self.device_connect_timeout_ms),
            read_timeout: Duration::from_millis(self.device_read_timeout_ms),
            write_timeout: Duration::from_millis(self.device_write_timeout_ms),
            reconnect_delay: Duration::from_millis(self.device_reconnect_delay_ms),
        })
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn min_lag_ms(&self) -> i64 {
        self.min_lag_ms
    }

    pub fn max_lag_ms(&self) -> i64 {
        self.max_lag_ms
    }

    pub fn exception_chute(&self) -> u8 {
        self.exception_chute
    }

    pub fn noread_sentinels(&self) -> &[String] {
        &self.noread_sentinels
    }

    pub fn binding_retention_ms(&self) -> u64 {
        self.binding_retention_ms
    }

    pub fn device_mode(&self) -> DeviceMode {
        self.device_mode
    }

    pub fn device_tcp_addr(&self) -> &str {
        &self.device_tcp_addr
    }

    pub fn device_serial_path(&self) -> &str {
        &self.device_serial_path
    }

    pub fn device_serial_baud(&self) -> u32 {
        self.device_serial_baud
    }

    pub fn device_write_timeout_ms(&self) -> u64 {
        self.device_write_timeout_ms
    }

    pub fn dispatch_workers(&self) -> usize {
        self.dispatch_workers
    }

    pub fn dispatch_queue_size(&self) -> usize {
        self.dispatch_queue_size
    }

    pub fn acquisition_enabled(&self) -> bool {
        self.acquisition_enabled
    }

    pub fn acquisition_port(&self) -> u16 {
        self.acquisition_port
    }

    pub fn exact_rules(&self) -> &HashMap<String, u8> {
        &self.exact_rules
    }

    pub fn default_chute(&self) -> Option<u8> {
        self.default_chute
    }

    pub fn decisions_file(&self) -> &str {
        &self.decisions_file
    }

    pub fn sink_queue_size(&self) -> usize {
        self.sink_queue_size
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to set the correlation window
    pub fn with_lag_window(mut self, min_lag_ms: i64, max_lag_ms: i64) -> Self {
        self.min_lag_ms = min_lag_ms;
        self.max_lag_ms = max_lag_ms;
        self
    }

    /// Builder method to set the exception chute
    pub fn with_exception_chute(mut self, chute: u8) -> Self {
        self.exception_chute = chute;
        self
    }

    /// Builder method to add an exact barcode rule
    pub fn with_exact_rule(mut self, barcode: &str, chute: u8) -> Self {
        self.exact_rules.insert(barcode.to_string(), chute);
        self
    }

    /// Builder method to add a prefix rule
    pub fn with_prefix_rule(mut self, prefix: &str, chute: u8) -> Self {
        self.prefix_rules.push((prefix.to_string(), chute));
        self
    }

    /// Builder method to set the binding retention
    pub fn with_binding_retention_ms(mut self, ms: u64) -> Self {
        self.binding_retention_ms = ms;
        self
    }
}
