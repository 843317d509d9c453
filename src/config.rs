//! Configuration management.
//!
//! Settings are consumed, not produced, by the hub: a TOML file under
//! `config/` supplies the broker address and credential, the MQTT connection
//! parameters and topic list, the raw listener bind address, and the storage
//! location. The library never reaches for configuration implicitly;
//! everything is loaded here once and passed down.

use crate::error::HubError;
use config::Config;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    pub broker: BrokerSettings,
    pub mqtt: MqttSettings,
    pub raw: RawSettings,
    pub storage: StorageSettings,
}

/// Buffer broker address and shared credential.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub credential: String,
}

impl BrokerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// MQTT broker endpoint and subscription set.
#[derive(Debug, Deserialize, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u64,
    pub client_id: String,
    /// Topic patterns, subscribed in this order during setup.
    pub topics: Vec<String>,
}

/// Raw TCP listener.
#[derive(Debug, Deserialize, Clone)]
pub struct RawSettings {
    pub bind_addr: String,
    /// Depth of the local queue between connection tasks and the forwarder.
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub default_path: String,
    pub default_format: String,
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> Result<Self, HubError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(HubError::Config)?;

        s.try_deserialize().map_err(HubError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.broker.port, 5555);
        assert_eq!(settings.broker.credential, "secret");
        assert_eq!(settings.broker.addr(), "localhost:5555");
        assert_eq!(settings.mqtt.topics.len(), 3);
        assert!(settings.raw.queue_depth > 0);
    }
}
