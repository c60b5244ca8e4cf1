//! # Gateway Wire Protocol
//!
//! The gateway speaks a small JSON protocol over two MQTT topics. Every message is
//! an envelope with a fixed `head`, a three digit `ctype` and a type specific
//! `data` object:
//!
//! ```text
//! {"head":"$SH","ctype":"005","id":17,"sn":"<gateway sn>","data":{...}}
//! ```
//!
//! | ctype | meaning               | direction                  |
//! |-------|-----------------------|----------------------------|
//! | 001   | bind gateway          | both (request / reply)     |
//! | 002   | gateway status report | both (report / reply)      |
//! | 003   | bind sub-device       | both (pairing / result)    |
//! | 004   | device control        | outbound, result inbound   |
//! | 005   | device status report  | inbound                    |
//!
//! ```text
//! protocol/
//! ├── frame.rs   - Frame and the five typed bodies
//! ├── action.rs  - Control actions and their `w_travel` values
//! ├── codec.rs   - decode/encode between payload bytes and frames
//! └── error.rs   - DecodeError
//! ```

pub mod action;
pub mod codec;
pub mod error;
pub mod frame;

pub use action::ControlAction;
pub use codec::{decode, encode};
pub use error::DecodeError;
pub use frame::{
    Attribute, BindDevice, BindGateway, DeviceControl, DeviceReport, DeviceStatus, Frame,
    FrameBody, GatewayStatus, Numeric, ProtocolType,
};

/// Topic all gateways report on.
pub const REPORT_TOPIC: &str = "gateway/rpt_rsp";

/// Topic a specific gateway receives requests on.
pub fn request_topic(gateway_sn: &str) -> String {
    format!("gateway/{}/req", gateway_sn)
}
