//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Adapter is (or became) disconnected; caller must reconnect.
    #[error("transport disconnected")]
    Disconnected,

    /// Controller entered bus-off; treated as disconnected by callers.
    #[error("CAN controller bus-off")]
    BusOff,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("transport not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// True for errors that leave the adapter unusable until reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::BusOff)
    }
}
