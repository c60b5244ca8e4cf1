//! Errors surfaced to collaborators through [`BridgeHandle`](crate::bridge::BridgeHandle).

use thiserror::Error;

use crate::protocol::ControlAction;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Gateway not found: {0}")]
    GatewayNotFound(String),

    #[error("Gateway already registered: {0}")]
    GatewayExists(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Set-position outside 0..=100
    #[error("Invalid position: {0}")]
    InvalidPosition(u8),

    /// No matching status report within the command timeout
    #[error("Command {action} for device {device_id} timed out")]
    CommandTimeout {
        device_id: String,
        action: ControlAction,
    },

    #[error("Command {action} for device {device_id} was superseded")]
    CommandSuperseded {
        device_id: String,
        action: ControlAction,
    },

    #[error("Command {action} for device {device_id} rejected with errcode {errcode}")]
    CommandRejected {
        device_id: String,
        action: ControlAction,
        errcode: i64,
    },

    #[error("Command {action} for device {device_id} was cancelled")]
    CommandCancelled {
        device_id: String,
        action: ControlAction,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Task error: {0}")]
    ThreadError(String),
}
