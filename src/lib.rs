//! Window-opener gateway bridge.
//!
//! Speaks the gateway's JSON frame protocol over MQTT, keeps one owned state
//! machine per gateway (devices, pairing window, outstanding commands) and
//! exposes it to entity adapters through [`BridgeHandle`] and a stream of
//! [`BridgeEvent`]s.

pub mod bridge;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mqtt;
pub mod persistence;
pub mod protocol;

pub use bridge::{BridgeHandle, BridgeOptions, CommandHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::BridgeError;
pub use gateway::{BridgeEvent, CommandOutcome, Device, GatewayInfo, GatewaySettings};
pub use protocol::{ControlAction, Frame};
