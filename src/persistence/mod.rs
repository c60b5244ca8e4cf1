//! # Persistence Module
//!
//! Keeps per-gateway state across restarts so device names stay stable: the
//! gateway serial, its bound flag, the ordinal counter and every device with the
//! ordinal it was given.
//!
//! ```text
//! <storage_dir>/
//! ├── SN123.toml
//! └── GW-7F01.toml
//! ```
//!
//! ## Error Handling Strategy
//! File operations use `color_eyre` for context. A missing snapshot is a fresh
//! gateway; an unreadable one is logged by the caller and also treated as fresh.

pub mod snapshot_store;

pub use snapshot_store::SnapshotStore;

use serde::{Deserialize, Serialize};

/// One device as it is written to disk.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub ordinal: u32,
    /// Last known travel, restored so entities start with a position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel: Option<u16>,
}

/// Everything needed to rebuild a gateway after a restart.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GatewaySnapshot {
    pub gateway_sn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub bound: bool,
    /// Ordinal the next paired device receives. Never decreases.
    pub next_ordinal: u32,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}
