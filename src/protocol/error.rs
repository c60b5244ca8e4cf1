use thiserror::Error;

/// Reasons an inbound payload could not be turned into a [`Frame`](super::Frame).
///
/// Neither variant is fatal. The dispatcher drops the payload, logs it and keeps
/// processing the next message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, missing envelope fields, or a `data` object of the wrong shape
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// `ctype` outside 001..=005
    #[error("Unknown protocol type: {0}")]
    UnknownProtocolType(String),
}
