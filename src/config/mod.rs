//! Process configuration and device records.
//!
//! Process-level settings come from environment variables (optionally via a
//! `.env` file). Device records live in a JSON store edited through the
//! operator command surface.

mod device;
mod store;

pub use device::{DeviceConfig, DeviceUpdate, DeviceValidationError, KEY_PATTERN};
pub use store::DeviceStore;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Load environment variables from a `.env` file in the working directory.
///
/// Variables already present in the environment win.
pub fn load_dotenv() {
    let content = match fs::read_to_string(Path::new(".env")) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        if std::env::var(&key).is_err() {
            // SAFETY: called from main before the tokio runtime exists
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Parse `KEY=value` lines. Values may contain spaces; one pair of
/// surrounding single or double quotes is removed.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let unquoted = ['"', '\'']
                .iter()
                .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
                .unwrap_or(value);
            Some((key.to_string(), unquoted.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// JSON file holding the device records
    pub devices_file: PathBuf,
    /// Unix socket for operator commands (also the single-instance lock)
    pub control_socket: PathBuf,
    /// Entity state feed; `None` when no broker is configured
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prefix of the per-entity attribute topics
    pub base_topic: String,
}

impl MqttConfig {
    pub fn new(broker_host: impl Into<String>) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port: 1883,
            client_id: "geomap-bridge".to_string(),
            username: None,
            password: None,
            base_topic: "homeassistant".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices_file: dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("geomap-bridge")
                .join("devices.json"),
            control_socket: default_control_socket(None),
            mqtt: None,
        }
    }
}

fn default_control_socket(runtime_dir: Option<String>) -> PathBuf {
    // XDG_RUNTIME_DIR is cleaned on logout, /tmp is the fallback
    runtime_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("geomap-bridge.sock")
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        config.control_socket = default_control_socket(var("XDG_RUNTIME_DIR"));

        if let Some(path) = var("GEOMAP_DEVICES_FILE") {
            config.devices_file = PathBuf::from(path);
        }
        if let Some(path) = var("GEOMAP_CONTROL_SOCKET") {
            config.control_socket = PathBuf::from(path);
        }

        if let Some(host) = var("MQTT_BROKER_HOST").filter(|h| !h.is_empty()) {
            let mut mqtt = MqttConfig::new(host);
            if let Some(port) = var("MQTT_BROKER_PORT")
                && let Ok(p) = port.parse()
            {
                mqtt.broker_port = p;
            }
            if let Some(client_id) = var("MQTT_CLIENT_ID") {
                mqtt.client_id = client_id;
            }
            mqtt.username = var("MQTT_USERNAME");
            mqtt.password = var("MQTT_PASSWORD");
            if let Some(base) = var("MQTT_BASE_TOPIC") {
                mqtt.base_topic = base.trim_end_matches('/').to_string();
            }
            config.mqtt = Some(mqtt);
        }

        config
    }
}
