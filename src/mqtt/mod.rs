//! # MQTT Transport
//!
//! The broker side of the bridge. Gateways publish every report on one shared
//! topic and receive requests on a topic of their own:
//!
//! ```text
//! gateway/rpt_rsp      gateway ──► bridge   (001/002/003/004/005)
//! gateway/<sn>/req     bridge  ──► gateway  (001/002 replies, 003, 004)
//! ```
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker settings
//! ├── message_manager.rs  - MqttMessage, the unit passed to and from the client
//! └── mqtt_handler.rs     - rumqttc event loop, decoding and routing
//! ```
//!
//! Reconnecting is the handler's job. Workers only see the resulting
//! connected/disconnected signal.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::MqttConfig;
pub use message_manager::MqttMessage;
pub use mqtt_handler::{ConnectionState, MqttHandler, MqttStatus};
