use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Bind frame arrived while no pairing session was open
    #[error("Pairing window closed for gateway {0}")]
    PairingWindowClosed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Gateway {gateway_sn} already holds {capacity} devices")]
    RegistryFull { gateway_sn: String, capacity: usize },
}
