//! Protocol-layer errors

use canprobe_bus::TransportError;
use thiserror::Error;

use crate::uds::NegativeResponseCode;

/// ISO-TP transfer errors. Timer names follow ISO 15765-2.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    /// Frame could not be handed to the controller in time.
    #[error("timeout transmitting frame (N_As)")]
    TimeoutNAs,

    /// Peer never answered our FirstFrame with FlowControl.
    #[error("timeout waiting for flow control (N_Bs)")]
    TimeoutNBs,

    /// Peer went silent between ConsecutiveFrames.
    #[error("timeout between consecutive frames (N_Cr)")]
    TimeoutNCr,

    #[error("consecutive frame out of sequence: expected {expected}, got {got}")]
    Sequence { expected: u8, got: u8 },

    /// Peer answered FlowControl OVFL: our PDU exceeds its buffer.
    #[error("peer reported receive overflow")]
    OverflowRemote,

    #[error("PDU length {len} outside 1..={max}")]
    InvalidLength { len: usize, max: usize },

    #[error("malformed ISO-TP frame: {0}")]
    InvalidFrame(String),

    /// Transfer cancelled by shutdown.
    #[error("transfer aborted")]
    Aborted,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced to UDS callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    /// Peer rejected the request with 0x7F. Never retried internally
    /// except NRC 0x78, which extends the wait instead of surfacing.
    #[error("negative response to service 0x{service:02X}: {nrc}")]
    Negative {
        service: u8,
        nrc: NegativeResponseCode,
    },

    /// No response within P2 (or P2* after a response-pending).
    #[error("no response within the P2 window")]
    Timeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Request resolved because of cancellation or shutdown.
    #[error("request cancelled")]
    Cancelled,

    /// The per-endpoint request queue is full; rejected synchronously.
    #[error("request queue full")]
    QueueFull,

    #[error(transparent)]
    IsoTp(IsoTpError),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl From<IsoTpError> for UdsError {
    fn from(err: IsoTpError) -> Self {
        // Transport loss is its own caller-facing kind; everything else
        // stays an ISO-TP error.
        match err {
            IsoTpError::Transport(t) => UdsError::Transport(t),
            other => UdsError::IsoTp(other),
        }
    }
}

/// Seed→key computation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Request sub-functions are odd by definition (the even sibling
    /// carries the key).
    #[error("security level 0x{0:02X} is not an odd request level")]
    InvalidLevel(u8),

    #[error("security provider failed: {0}")]
    Provider(String),

    #[error("security provider exceeded its {0} ms deadline")]
    ProviderTimeout(u64),
}
