//! Client configuration
//!
//! Loaded from TOML. A missing file is not an error: every section has
//! defaults so a device can register with zero configuration. A file that
//! exists but does not parse is reported.
//!
//! ```toml
//! [mqtt]
//! keep_alive_secs = 60
//! client_id_prefix = "iottalk-rs"
//! data_qos = 0
//!
//! [http]
//! timeout_secs = 10
//!
//! [device]
//! url = "http://localhost:9992"
//! name = "Dummy"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::transport::Qos;

const CONFIG_DIR: &str = "iottalk";
const CONFIG_FILE: &str = "dan.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DanConfig {
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
    pub device: DeviceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub keep_alive_secs: u64,
    /// Client ids are `<prefix>-<random hex>`
    pub client_id_prefix: String,
    /// Capacity of the MQTT client's request channel
    pub channel_capacity: usize,
    /// Pause between reconnect attempts after a dropped link
    pub reconnect_delay_ms: u64,
    /// How long a requested close may take before the link counts as closed
    pub close_grace_ms: u64,
    /// QoS for data channels; the control plane always uses QoS 2
    pub data_qos: Qos,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 60,
            client_id_prefix: "iottalk-rs".to_string(),
            channel_capacity: 100,
            reconnect_delay_ms: 1_000,
            close_grace_ms: 2_000,
            data_qos: Qos::AtMostOnce,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Registration defaults used by the demo binary
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub url: String,
    pub name: Option<String>,
    pub id: Option<String>,
    pub accept_protos: Option<Vec<String>>,
}

impl DanConfig {
    /// `<config dir>/iottalk/dan.toml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push(CONFIG_DIR);
            path.push(CONFIG_FILE);
            path
        })
    }

    /// Loads the config at `path`, falling back to defaults if it does not exist
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        if !exists {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let config = Self::from_toml(&content).map_err(|source| match source {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Loads from [`DanConfig::default_path`], or defaults without a config dir
    pub async fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.channel_capacity must be positive".to_string(),
            ));
        }
        if self.mqtt.client_id_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "mqtt.client_id_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
