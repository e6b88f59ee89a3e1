//! Configuration for the edge agent.
//!
//! Settings come from an optional YAML file (path in `EDGE_AGENT_CONFIG`),
//! then `EDGE_AGENT_*` environment variables override individual values.
//! The merged result is validated before the agent starts; any problem is
//! fatal.
//!
//! ```yaml
//! device:
//!   identifier: press-line-04
//!   factory_id: 12
//! backend:
//!   url: https://api.zerocraftr.example
//! mqtt:
//!   host: broker.zerocraftr.example
//!   port: 1883
//! poll_interval_seconds: 10
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable naming the YAML config file
pub const CONFIG_PATH_VAR: &str = "EDGE_AGENT_CONFIG";

const DEFAULT_DEVICE_IDENTIFIER: &str = "edge-device-001";

const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

const DEFAULT_MQTT_HOST: &str = "localhost";

const DEFAULT_MQTT_PORT: u16 = 1883;

const DEFAULT_TOPIC_PREFIX: &str = "zerocraftr/telemetry";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

const DEFAULT_BUFFER_PATH: &str = "buffer.sqlite";

/// HTTP timeout; kept short so a dead backend does not stall the cycle
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

const MIN_POLL_INTERVAL_SECS: u64 = 1;

const MAX_POLL_INTERVAL_SECS: u64 = 3600;

const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;

const MAX_REQUEST_TIMEOUT_SECS: u64 = 60;

/// rumqttc rejects keep-alive intervals below this
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// A zero delay would retry a dead broker in a tight loop
const MIN_RECONNECT_DELAY_SECS: u64 = 1;

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this device; also the MQTT destination key
    pub device_identifier: String,

    /// Site/factory the device belongs to
    pub factory_id: u32,

    /// Base URL of the backend API, without trailing slash
    pub backend_url: String,

    /// Full URL of the telemetry ingestion endpoint
    pub telemetry_url: String,

    pub mqtt_host: String,

    pub mqtt_port: u16,

    /// Topics are `<topic_prefix>/<device_identifier>`
    pub topic_prefix: String,

    /// Time between collection cycles
    pub poll_interval: Duration,

    /// SQLite file backing the local buffer
    pub buffer_path: PathBuf,

    /// Optional cap on buffered samples; oldest are evicted beyond it
    pub buffer_max_entries: Option<usize>,

    /// HTTP request timeout
    pub request_timeout: Duration,

    pub mqtt_keep_alive: Duration,

    /// Pause between MQTT reconnect attempts
    pub mqtt_reconnect_delay: Duration,
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Configuration error for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    device: DeviceSection,
    backend: BackendSection,
    mqtt: MqttSection,
    poll_interval_seconds: Option<u64>,
    buffer_path: Option<PathBuf>,
    buffer_max_entries: Option<usize>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DeviceSection {
    identifier: Option<String>,
    factory_id: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BackendSection {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MqttSection {
    host: Option<String>,
    port: Option<u16>,
    topic_prefix: Option<String>,
    keep_alive_seconds: Option<u64>,
    reconnect_delay_seconds: Option<u64>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load configuration from the process environment (and the YAML file it
    /// points to, if any).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match lookup(CONFIG_PATH_VAR) {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::build(file, lookup)
    }

    /// Parse a YAML document with no environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: FileConfig =
            serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::build(file, |_| None)
    }

    fn build<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // File values
        if let Some(v) = file.device.identifier {
            config.device_identifier = v;
        }
        if let Some(v) = file.device.factory_id {
            config.factory_id = v;
        }
        if let Some(v) = file.backend.url {
            config.backend_url = v;
        }
        if let Some(v) = file.mqtt.host {
            config.mqtt_host = v;
        }
        if let Some(v) = file.mqtt.port {
            config.mqtt_port = v;
        }
        if let Some(v) = file.mqtt.topic_prefix {
            config.topic_prefix = v;
        }
        if let Some(v) = file.mqtt.keep_alive_seconds {
            config.mqtt_keep_alive = Duration::from_secs(v);
        }
        if let Some(v) = file.mqtt.reconnect_delay_seconds {
            config.mqtt_reconnect_delay = Duration::from_secs(v);
        }
        if let Some(v) = file.poll_interval_seconds {
            config.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.buffer_path {
            config.buffer_path = v;
        }
        if file.buffer_max_entries.is_some() {
            config.buffer_max_entries = file.buffer_max_entries;
        }
        if let Some(v) = file.request_timeout_seconds {
            config.request_timeout = Duration::from_secs(v);
        }

        // Environment overrides
        if let Some(v) = lookup("EDGE_AGENT_DEVICE_ID") {
            config.device_identifier = v;
        }
        if let Some(v) = parse_var(&lookup, "EDGE_AGENT_FACTORY_ID")? {
            config.factory_id = v;
        }
        if let Some(v) = lookup("EDGE_AGENT_BACKEND_URL") {
            config.backend_url = v;
        }
        if let Some(v) = lookup("EDGE_AGENT_MQTT_HOST") {
            config.mqtt_host = v;
        }
        if let Some(v) = parse_var(&lookup, "EDGE_AGENT_MQTT_PORT")? {
            config.mqtt_port = v;
        }
        if let Some(v) = lookup("EDGE_AGENT_TOPIC_PREFIX") {
            config.topic_prefix = v;
        }
        if let Some(v) = parse_var(&lookup, "EDGE_AGENT_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = lookup("EDGE_AGENT_BUFFER_PATH") {
            config.buffer_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var(&lookup, "EDGE_AGENT_BUFFER_MAX_ENTRIES")? {
            config.buffer_max_entries = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "EDGE_AGENT_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "EDGE_AGENT_MQTT_KEEP_ALIVE_SECS")? {
            config.mqtt_keep_alive = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "EDGE_AGENT_MQTT_RECONNECT_DELAY_SECS")? {
            config.mqtt_reconnect_delay = Duration::from_secs(v);
        }

        config.backend_url = config.backend_url.trim_end_matches('/').to_string();
        config.telemetry_url = format!("{}/telemetry", config.backend_url);
        config.topic_prefix = config.topic_prefix.trim_end_matches('/').to_string();

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device_identifier.trim().is_empty() {
            return Err(ConfigError::invalid("device.identifier", "must not be empty"));
        }
        if self
            .device_identifier
            .contains(|c| matches!(c, '/' | '+' | '#'))
        {
            return Err(ConfigError::invalid(
                "device.identifier",
                format!(
                    "'{}' contains an MQTT topic separator or wildcard",
                    self.device_identifier
                ),
            ));
        }

        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://"))
        {
            return Err(ConfigError::invalid(
                "backend.url",
                format!("'{}' is not an http(s) URL", self.backend_url),
            ));
        }

        if self.mqtt_host.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt_port == 0 {
            return Err(ConfigError::invalid("mqtt.port", "must be greater than 0"));
        }
        if self.topic_prefix.is_empty() {
            return Err(ConfigError::invalid("mqtt.topic_prefix", "must not be empty"));
        }
        if self.mqtt_keep_alive.as_secs() < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::invalid(
                "mqtt.keep_alive_seconds",
                format!("must be at least {}s", MIN_KEEP_ALIVE_SECS),
            ));
        }
        if self.mqtt_reconnect_delay.as_secs() < MIN_RECONNECT_DELAY_SECS {
            return Err(ConfigError::invalid(
                "mqtt.reconnect_delay_seconds",
                format!("must be at least {}s", MIN_RECONNECT_DELAY_SECS),
            ));
        }

        let poll = self.poll_interval.as_secs();
        if poll < MIN_POLL_INTERVAL_SECS {
            return Err(ConfigError::invalid(
                "poll_interval_seconds",
                format!("poll interval {} is below minimum ({}s)", poll, MIN_POLL_INTERVAL_SECS),
            ));
        }
        if poll > MAX_POLL_INTERVAL_SECS {
            return Err(ConfigError::invalid(
                "poll_interval_seconds",
                format!("poll interval {} exceeds maximum ({}s)", poll, MAX_POLL_INTERVAL_SECS),
            ));
        }

        let timeout = self.request_timeout.as_secs();
        if !(MIN_REQUEST_TIMEOUT_SECS..=MAX_REQUEST_TIMEOUT_SECS).contains(&timeout) {
            return Err(ConfigError::invalid(
                "request_timeout_seconds",
                format!(
                    "timeout {} outside allowed range ({}-{}s)",
                    timeout, MIN_REQUEST_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS
                ),
            ));
        }

        if self.buffer_max_entries == Some(0) {
            return Err(ConfigError::invalid(
                "buffer_max_entries",
                "must be greater than 0 when set",
            ));
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a valid number", value))),
        None => Ok(None),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_identifier: DEFAULT_DEVICE_IDENTIFIER.to_string(),
            factory_id: 0,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            telemetry_url: format!("{}/telemetry", DEFAULT_BACKEND_URL),
            mqtt_host: DEFAULT_MQTT_HOST.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            buffer_path: PathBuf::from(DEFAULT_BUFFER_PATH),
            buffer_max_entries: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            mqtt_keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            mqtt_reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
        }
    }
}
