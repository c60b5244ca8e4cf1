//! # Gateway Protocol Manager
//!
//! Everything that belongs to one gateway lives behind a single owner:
//!
//! ```text
//! gateway/
//! ├── registry.rs    - devices and their ordinal names
//! ├── pairing.rs     - Idle / Pairing(deadline) / Bound
//! ├── correlator.rs  - outstanding control commands
//! ├── dispatcher.rs  - GatewayCore, turning frames into effects
//! ├── events.rs      - notifications for entity adapters
//! ├── worker.rs      - tokio task owning one GatewayCore
//! └── router.rs      - inbound demultiplexing by gateway serial
//! ```
//!
//! Frames for one gateway are processed strictly in arrival order by its worker.
//! Workers of different gateways share no mutable state.

pub mod dispatcher;
pub mod correlator;
pub mod error;
pub mod events;
pub mod pairing;
pub mod registry;
pub mod router;
pub mod worker;

pub use dispatcher::{Effect, GatewayCore, GatewayInfo, GatewaySettings, DEFAULT_CLIENT_UUID};
pub use correlator::{CommandCorrelator, CommandId, CommandOutcome, OutstandingCommand};
pub use error::RegistryError;
pub use events::{BridgeEvent, OfflineReason};
pub use pairing::{PairingEndReason, PairingMachine, PairingStart, PairingState};
pub use registry::{Device, DeviceRegistry, PositionState, Registration};
pub use router::GatewayRouter;
pub use worker::{GatewayWorker, GatewayWorkerHandle, WorkerMessage};
