//! Notifications published to entity adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::correlator::{CommandId, CommandOutcome};
use super::pairing::PairingEndReason;
use super::registry::PositionState;
use crate::protocol::ControlAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// No frame within the liveness timeout
    HeartbeatLost,
    TransportDown,
    /// 001 answered with a non-zero errcode
    BindFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    GatewayOnline {
        gateway_sn: String,
        bound: bool,
    },
    GatewayOffline {
        gateway_sn: String,
        reason: OfflineReason,
    },
    PairingStarted {
        gateway_sn: String,
        deadline: DateTime<Utc>,
    },
    PairingEnded {
        gateway_sn: String,
        reason: PairingEndReason,
    },
    DeviceAdded {
        gateway_sn: String,
        device_id: String,
        ordinal: u32,
        name: String,
    },
    DeviceRemoved {
        gateway_sn: String,
        device_id: String,
        name: String,
    },
    DeviceUpdated {
        gateway_sn: String,
        device_id: String,
        travel: Option<u16>,
        position: PositionState,
        battery_voltage: Option<f64>,
        online: bool,
    },
    CommandResolved {
        gateway_sn: String,
        device_id: String,
        command_id: CommandId,
        action: ControlAction,
        outcome: CommandOutcome,
    },
}

impl BridgeEvent {
    pub fn gateway_sn(&self) -> &str {
        match self {
            BridgeEvent::GatewayOnline { gateway_sn, .. }
            | BridgeEvent::GatewayOffline { gateway_sn, .. }
            | BridgeEvent::PairingStarted { gateway_sn, .. }
            | BridgeEvent::PairingEnded { gateway_sn, .. }
            | BridgeEvent::DeviceAdded { gateway_sn, .. }
            | BridgeEvent::DeviceRemoved { gateway_sn, .. }
            | BridgeEvent::DeviceUpdated { gateway_sn, .. }
            | BridgeEvent::CommandResolved { gateway_sn, .. } => gateway_sn,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            BridgeEvent::DeviceAdded { device_id, .. }
            | BridgeEvent::DeviceRemoved { device_id, .. }
            | BridgeEvent::DeviceUpdated { device_id, .. }
            | BridgeEvent::CommandResolved { device_id, .. } => Some(device_id),
            _ => None,
        }
    }
}
