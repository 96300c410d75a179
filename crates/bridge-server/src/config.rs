//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`iot-bridge.toml`, `/etc/iot-bridge/iot-bridge.toml`,
//!   `~/.config/iot-bridge/iot-bridge.toml`, or `--config <path>`)
//! - Environment variables (`BRIDGE_*`, `__` for nesting, e.g. `BRIDGE_BROKER__HOST`)

use anyhow::{Context, Result};
use iot_bridge_broker::{ManagerConfig, RumqttSettings};
use iot_bridge_core::device::default_devices;
use iot_bridge_core::{BridgeConfig, Device, DeviceTable, DEFAULT_TELEMETRY_TOPIC};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, first match wins.
const CONFIG_PATHS: [&str; 3] = [
    "iot-bridge.toml",
    "/etc/iot-bridge/iot-bridge.toml",
    "~/.config/iot-bridge/iot-bridge.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Viewer endpoint configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Broker connection.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Controllable devices.
    #[serde(default = "default_devices")]
    pub devices: Vec<Device>,

    /// History store.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Viewer endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Prefix of the per-attempt client identity.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,

    /// Buffered broker events between the connection and the bridge.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// History store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Mysql,
}

/// History store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// Database URL for the `mysql` backend.
    #[serde(default)]
    pub url: Option<String>,

    /// Drop a status broadcast when its device action cannot be stored.
    #[serde(default)]
    pub gate_status_broadcast: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "iot_web_client".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    4_000
}

fn default_reconnect_interval() -> u64 {
    1_000
}

fn default_telemetry_topic() -> String {
    DEFAULT_TELEMETRY_TOPIC.to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            broker: BrokerConfig::default(),
            devices: default_devices(),
            persistence: PersistenceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id_prefix: default_client_id_prefix(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
            telemetry_topic: default_telemetry_topic(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl BrokerConfig {
    /// rumqttc transport settings.
    #[must_use]
    pub fn rumqtt_settings(&self) -> RumqttSettings {
        RumqttSettings {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: Duration::from_secs(self.keep_alive),
            ..Default::default()
        }
    }

    /// Connection manager settings for the given subscriptions.
    #[must_use]
    pub fn manager_config(&self, subscriptions: Vec<String>) -> ManagerConfig {
        ManagerConfig {
            client_id_prefix: self.client_id_prefix.clone(),
            subscriptions,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            event_capacity: self.event_capacity,
            ..Default::default()
        }
    }
}

impl Config {
    /// Load configuration from the first default path found, overlaid with
    /// `BRIDGE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::build(path.as_deref())
    }

    /// Load configuration from a specific file, overlaid with `BRIDGE_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::build(Some(path))
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    fn build(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("BRIDGE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// The validated device table.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured devices are empty or collide.
    pub fn device_table(&self) -> Result<DeviceTable> {
        DeviceTable::new(self.devices.clone()).context("Invalid device configuration")
    }

    /// Bridge settings.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            telemetry_topic: self.broker.telemetry_topic.clone(),
            gate_status_on_persistence: self.persistence.gate_status_broadcast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.client_id_prefix, "iot_web_client");
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
        assert!(!config.persistence.gate_status_broadcast);
        assert_eq!(config.device_table().unwrap().len(), 3);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 3000);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "127.0.0.1"
            port = 9000

            [broker]
            host = "mqtt.local"
            username = "iot"
            password = "secret"
            reconnect_interval_ms = 2500

            [persistence]
            backend = "mysql"
            url = "mysql://iot:secret@db/iot"
            gate_status_broadcast = true

            [[devices]]
            key = "pump"
            label = "Water pump"
            status_topic = "farm/pump/status"
            control_topic = "farm/pump/command"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.broker.host, "mqtt.local");
        assert_eq!(config.broker.keep_alive, 60);
        assert_eq!(config.persistence.backend, PersistenceBackend::Mysql);
        assert!(config.bridge_config().gate_status_on_persistence);

        let devices = config.device_table().unwrap();
        assert_eq!(devices.resolve("water pump").unwrap().key.as_str(), "pump");

        let manager = config.broker.manager_config(vec!["a".to_string()]);
        assert_eq!(manager.reconnect_interval, Duration::from_millis(2500));
        assert_eq!(manager.connect_timeout, Duration::from_secs(4));

        let settings = config.broker.rumqtt_settings();
        assert_eq!(settings.username.as_deref(), Some("iot"));
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn test_from_file_applies_env_overlay() {
        let path = std::env::temp_dir().join(format!("iot-bridge-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "port = 9000\n\n[broker]\nhost = \"file-broker\"\n",
        )
        .unwrap();
        std::env::set_var("BRIDGE_BROKER__HOST", "env-broker");

        let config = Config::from_file(&path);
        std::env::remove_var("BRIDGE_BROKER__HOST");
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.broker.host, "env-broker");
        assert_eq!(config.transport.websocket_path, "/ws");
    }

    #[test]
    fn test_from_file_missing_is_error() {
        assert!(Config::from_file("/nonexistent/iot-bridge.toml").is_err());
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let config = Config {
            devices: vec![
                Device::new("fan", "Fan", "a/status", "a/command"),
                Device::new("FAN", "Ceiling fan", "b/status", "b/command"),
            ],
            ..Config::default()
        };
        assert!(config.device_table().is_err());
    }
}
