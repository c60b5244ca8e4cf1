use serde::{Deserialize, Serialize};

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Request channel capacity of the MQTT client
    pub capacity: usize,
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "openerbridge".to_string(),
            user: None,
            password: None,
            keep_alive_secs: 30,
            capacity: 100,
            reconnect_delay_secs: 3,
        }
    }
}
