//! Service configuration
//!
//! Settings are read from a TOML file and then overridden from the
//! environment using the variable names the broker deployment already uses
//! (`MQTT_BROKER_HOST`, `MQTT_TOPICS`, ...). Every field has a default so a
//! missing file still yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "mqtt-ingest";
const CONFIG_FILE: &str = "config.toml";
const DB_DIR: &str = "db";

/// Environment variable pointing at an alternative config file
pub const CONFIG_PATH_ENV: &str = "MQTT_INGEST_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidOverride { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub supervisor: SupervisorSettings,
    pub storage: StorageSettings,
    pub logging: LogSettings,
}

/// Broker endpoint and session parameters
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Combined with the process id to form the client identifier
    pub client_id_prefix: String,
    /// Topic filters subscribed on every connect
    pub topics: Vec<String>,
    pub subscribe_qos: u8,
    /// Ports that imply a TLS endpoint
    pub tls_ports: Vec<u16>,
    pub reconnect_min_delay_secs: u64,
    pub reconnect_max_delay_secs: u64,
    /// Capacity of the client request queue
    pub request_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keepalive_secs: 60,
            username: None,
            password: None,
            client_id_prefix: "mqtt-ingest".to_string(),
            topics: vec!["#".to_string()],
            subscribe_qos: 0,
            tls_ports: vec![8883],
            reconnect_min_delay_secs: 1,
            reconnect_max_delay_secs: 32,
            request_capacity: 100,
        }
    }
}

impl BrokerSettings {
    pub fn use_tls(&self) -> bool {
        self.tls_ports.contains(&self.port)
    }

    /// Credentials are only applied when both halves are configured
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pw)) if !user.is_empty() && !pw.is_empty() => {
                Some((user.clone(), pw.clone()))
            }
            _ => None,
        }
    }

    /// Client identifier unique to this process instance
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, std::process::id())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Wait after stopping a previous session so its socket is released
    pub teardown_grace_ms: u64,
    pub event_capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            teardown_grace_ms: 500,
            event_capacity: 1000,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl SupervisorSettings {
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sled,
    Memory,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub path: PathBuf,
    /// Create the connection status table at startup
    pub provision_on_start: bool,
    /// Skip status writes quietly while the status table does not exist
    pub tolerate_unprovisioned_status: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let mut path = data_dir();
        path.push(CONFIG_DIR);
        path.push(DB_DIR);
        Self {
            backend: StorageBackend::Sled,
            path,
            provision_on_start: true,
            tolerate_unprovisioned_status: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogSettings {
    pub fn max_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level {:?}, falling back to info", self.level);
            tracing::Level::INFO
        })
    }
}

impl Settings {
    /// Loads settings from `path` (or the default location), then applies
    /// environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

        let mut settings = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_toml(&content)?
        } else {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            Self::default()
        };

        settings.apply_overrides(|var| std::env::var(var).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `MQTT_*` overrides; `lookup` resolves a variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker = &mut self.broker;

        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            broker.host = host;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT") {
            broker.port = port.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                var: "MQTT_BROKER_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(keepalive) = lookup("MQTT_KEEPALIVE") {
            broker.keepalive_secs =
                keepalive
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        var: "MQTT_KEEPALIVE",
                        value: keepalive.clone(),
                    })?;
        }
        if let Some(user) = lookup("MQTT_USERNAME") {
            broker.username = Some(user);
        }
        if let Some(pw) = lookup("MQTT_PASSWORD") {
            broker.password = Some(pw);
        }
        if let Some(prefix) = lookup("MQTT_CLIENT_ID") {
            broker.client_id_prefix = prefix;
        }
        if let Some(topics) = lookup("MQTT_TOPICS") {
            broker.topics = topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        debug!("Effective broker settings: {}:{}", broker.host, broker.port);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".into()));
        }
        if broker.topics.is_empty() {
            return Err(ConfigError::Invalid("no subscription topics configured".into()));
        }
        if broker.subscribe_qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "subscribe_qos must be 0, 1 or 2, got {}",
                broker.subscribe_qos
            )));
        }
        if broker.reconnect_min_delay_secs > broker.reconnect_max_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "reconnect delay bounds inverted: {} > {}",
                broker.reconnect_min_delay_secs, broker.reconnect_max_delay_secs
            )));
        }
        Ok(())
    }
}

/// `$MQTT_INGEST_CONFIG`, else `<config dir>/mqtt-ingest/config.toml`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(|| {
        warn!("Could not determine data directory, using current directory");
        PathBuf::from(".")
    })
}
