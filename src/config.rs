//! Adapter configuration.
//!
//! Supports YAML file and environment variable overrides.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::QoS;

/// Adapter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// MQTT broker connection.
    pub broker: BrokerConfig,
    /// DIMSE server surface.
    pub server: ServerConfig,
    /// Application entity registry source.
    pub registry: RegistryConfig,
    /// Health aggregator settings.
    pub health: HealthConfig,
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Base topic for workitem events.
    pub topic_prefix: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic_prefix: "/workitems".to_string(),
            keep_alive_secs: 60,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// DIMSE server surface configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// AE title of the adapter, also used as the shared bus client id.
    pub ae_title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11119,
            ae_title: "UPSEventBroker01".to_string(),
        }
    }
}

/// Application entity registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path to the JSON list of AE records.
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "ApplicationEntities.json".to_string(),
        }
    }
}

/// Health aggregator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Run the background health loop.
    pub enabled: bool,
    /// Interval between probe cycles in seconds.
    pub interval_secs: u64,
    /// Base topic for health status messages.
    pub topic_prefix: String,
    /// QoS level (0..=2) for status messages.
    pub qos: u8,
    /// Whether status messages are retained.
    pub retained: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            topic_prefix: "health/dicom_broker".to_string(),
            qos: 1,
            retained: true,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn status_qos(&self) -> QoS {
        QoS::from_level(self.qos)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("UPSBRIDGE_CONFIG").unwrap_or_else(|_| "upsbridge.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("BROKER_HOST") {
            self.broker.host = host;
        }

        if let Ok(port) = std::env::var("BROKER_PORT") {
            if let Ok(p) = port.parse() {
                self.broker.port = p;
            }
        }

        if let Ok(port) = std::env::var("SERVER_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(title) = std::env::var("SERVER_AE_TITLE") {
            self.server.ae_title = title;
        }

        if let Ok(path) = std::env::var("AE_REGISTRY_PATH") {
            self.registry.path = path;
        }

        if let Ok(interval) = std::env::var("HEALTH_INTERVAL_SECS") {
            if let Ok(i) = interval.parse() {
                self.health.interval_secs = i;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker.host, "127.0.0.1");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.server.port, 11119);
        assert_eq!(config.server.ae_title, "UPSEventBroker01");
        assert_eq!(config.registry.path, "ApplicationEntities.json");
        assert_eq!(config.health.interval_secs, 30);
        assert!(config.health.retained);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
broker:
  host: mqtt.example.org
  port: 8883
  topic_prefix: /site1/workitems

server:
  port: 10400
  ae_title: SITE1_BROKER

registry:
  path: /etc/upsbridge/aes.json

health:
  interval_secs: 10
  qos: 0
  retained: false
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broker.host, "mqtt.example.org");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.topic_prefix, "/site1/workitems");
        assert_eq!(config.server.ae_title, "SITE1_BROKER");
        assert_eq!(config.registry.path, "/etc/upsbridge/aes.json");
        assert_eq!(config.health.interval_secs, 10);
        assert_eq!(config.health.status_qos(), QoS::AtMostOnce);
        assert!(!config.health.retained);
    }
}
