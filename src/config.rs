//! Bridge configuration file
//!
//! A single TOML document with `[[broker]]` and `[[point]]` tables:
//!
//! ```toml
//! [[broker]]
//! name = "plant"
//! host = "broker.example"
//!
//! [[point]]
//! id = 1
//! broker = "plant"
//! kind = "analogue"
//! topic = "sensor/1"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, FieldError};
use crate::mqtt::{BrokerConfig, SecurityMode};
use crate::point::{PointConfig, PointKind};

const CONFIG_DIR: &str = "pointlink";
const CONFIG_FILE: &str = "bridge.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct BridgeConfig {
    #[serde(default, rename = "broker")]
    pub brokers: Vec<BrokerConfig>,
    #[serde(default, rename = "point")]
    pub points: Vec<PointConfig>,
}

impl BridgeConfig {
    /// `<config dir>/pointlink/bridge.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let config = Self::from_toml(&content)?;
        info!(
            "Loaded {} brokers and {} points from {}",
            config.brokers.len(),
            config.points.len(),
            path.display()
        );
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io_error)?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn broker(&self, name: &str) -> Option<&BrokerConfig> {
        self.brokers.iter().find(|broker| broker.name == name)
    }

    /// Points scanned by the named broker
    pub fn points_for(&self, broker: &str) -> Vec<PointConfig> {
        self.points
            .iter()
            .filter(|point| point.broker == broker)
            .cloned()
            .collect()
    }

    /// Collects every field-level problem instead of stopping at the first.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        let mut push = |object: String, field: &'static str, message: &str| {
            errors.push(FieldError {
                object,
                field,
                message: message.to_string(),
            })
        };

        let mut broker_names = HashSet::new();
        for broker in &self.brokers {
            let object = format!("broker '{}'", broker.name);
            if broker.name.trim().is_empty() {
                push(object.clone(), "name", "Broker name should not be blank.");
            } else if !broker_names.insert(broker.name.as_str()) {
                push(object.clone(), "name", "Duplicate broker name.");
            }
            if broker.host.trim().is_empty() {
                push(object.clone(), "host", "Broker Host name/address is empty.");
            }
            if broker.port == 0 {
                push(object.clone(), "port", "Broker Port is zero.");
            }
            if broker.client_id.trim().is_empty() {
                push(object.clone(), "client_id", "Client identifier should not be blank.");
            }
            if (1..5).contains(&broker.keep_alive_secs) {
                push(object.clone(), "keep_alive_secs", "Keep-alive must be 0 or at least 5 seconds.");
            }
            if broker.connect_timeout_secs == 0 {
                push(object.clone(), "connect_timeout_secs", "Connect timeout must be positive.");
            }
            if broker.retry_interval_secs == 0 {
                push(object.clone(), "retry_interval_secs", "Retry interval must be positive.");
            }
            if broker.security != SecurityMode::None && broker.ca_cert_file.is_none() {
                push(
                    object.clone(),
                    "ca_cert_file",
                    "CA certificate file is required when security is enabled.",
                );
            }
            if broker.client_cert_file.is_some() != broker.client_key_file.is_some() {
                push(
                    object.clone(),
                    "client_key_file",
                    "Client certificate and client key must be given together.",
                );
            }
        }

        let mut point_ids = HashSet::new();
        let mut topics: HashMap<(&str, &str), u32> = HashMap::new();
        for point in &self.points {
            let object = format!("point {}", point.id);
            if !point_ids.insert(point.id) {
                push(object.clone(), "id", "Duplicate point id.");
            }
            if !broker_names.contains(point.broker.as_str()) {
                push(object.clone(), "broker", "Referenced broker is not defined.");
            }
            if point.topic.trim().is_empty() {
                push(object.clone(), "topic", "Topic name should not be blank.");
            } else if let Some(owner) =
                topics.insert((point.broker.as_str(), point.topic.as_str()), point.id.0)
            {
                debug!("Topic {} shared by points {} and {}", point.topic, owner, point.id);
                push(
                    object.clone(),
                    "topic",
                    "Duplicate topic name shared by another point.",
                );
            }
            if point.kind == PointKind::Timestamp && !point.control_topic.is_empty() {
                push(
                    object.clone(),
                    "control_topic",
                    "Timestamp points cannot be controlled.",
                );
            }
        }

        errors
    }

    /// Validated copy, or every problem found
    pub fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}
