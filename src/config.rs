use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

use crate::gateway::{GatewaySettings, DEFAULT_CLIENT_UUID};
use crate::mqtt::MqttConfig;

const CONFIG_DIR: &str = ".config/openerbridge";
const CONFIG_FILE: &str = "config.toml";
const STORAGE_DIR: &str = "gateways";

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "OPENERBRIDGE_CONFIG";

/// Upper bound for every configured duration (one year).
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub pairing_window_secs: u64,
    /// Silence after which a gateway is reported offline
    pub liveness_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Period of the 002 status request sent while auto discovery is on
    pub discovery_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pairing_window_secs: 60,
            liveness_timeout_secs: 1200,
            command_timeout_secs: 30,
            sweep_interval_secs: 5,
            discovery_interval_secs: 300,
        }
    }
}

/// Publish failures are retried immediately, acknowledgement timeouts never are.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub publish_retries: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GatewayEntry {
    pub sn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: String,
    /// UUID handed to gateways in bind replies
    pub client_uuid: String,
    pub storage_dir: PathBuf,
    /// Periodically ask every gateway for its device list
    pub auto_discovery: bool,
    pub mqtt: MqttConfig,
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub gateways: Vec<GatewayEntry>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            client_uuid: DEFAULT_CLIENT_UUID.to_string(),
            storage_dir: config_dir().join(STORAGE_DIR),
            auto_discovery: true,
            mqtt: MqttConfig::default(),
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            gateways: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Config file location, honouring [`CONFIG_ENV`].
    pub fn config_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => config_dir().join(CONFIG_FILE),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config {}: {}", path.display(), e))?;
        let config = Self::parse(&content)
            .map_err(|e| eyre!("Invalid config {}: {}", path.display(), e))?;
        info!(
            "Loaded config {} with {} gateways",
            path.display(),
            config.gateways.len()
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config {}: {}", path.display(), e))
    }

    /// Writes a default config when none exists yet.
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config {}: {}", path.display(), e))?
        {
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());
        BridgeConfig::default().save(path).await
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for gateway in &self.gateways {
            let sn = gateway.sn.trim();
            if sn.is_empty() {
                return Err(eyre!("Gateway serial must not be empty"));
            }
            if !seen.insert(sn) {
                return Err(eyre!("Gateway {} configured twice", sn));
            }
        }

        let timings = [
            ("pairing_window_secs", self.timing.pairing_window_secs),
            ("liveness_timeout_secs", self.timing.liveness_timeout_secs),
            ("command_timeout_secs", self.timing.command_timeout_secs),
            ("sweep_interval_secs", self.timing.sweep_interval_secs),
            ("discovery_interval_secs", self.timing.discovery_interval_secs),
        ];
        for (name, value) in timings {
            if value == 0 || value > MAX_DURATION_SECS {
                return Err(eyre!("timing.{} must be within 1..={}", name, MAX_DURATION_SECS));
            }
        }

        if self.client_uuid.trim().is_empty() {
            return Err(eyre!("client_uuid must not be empty"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(eyre!("mqtt.host must not be empty"));
        }
        Ok(())
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            pairing_window: seconds(self.timing.pairing_window_secs),
            liveness_timeout: seconds(self.timing.liveness_timeout_secs),
            command_timeout: seconds(self.timing.command_timeout_secs),
            publish_retries: self.retry.publish_retries,
            client_uuid: self.client_uuid.clone(),
            discovery_interval: self
                .auto_discovery
                .then(|| seconds(self.timing.discovery_interval_secs)),
        }
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timing.sweep_interval_secs.max(1))
    }

    pub fn log_level(&self) -> Level {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level {:?}, using info", self.log_level);
            Level::INFO
        })
    }
}

fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(MAX_DURATION_SECS) as i64)
}

fn config_dir() -> PathBuf {
    get_home_dir().join(CONFIG_DIR)
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
