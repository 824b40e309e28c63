//! Transport adapters for raw CAN devices
//!
//! A transport is opened as a split pair: the receive half ([`FrameSource`])
//! is move-only and gets consumed by the dispatcher, the send half
//! ([`FrameSink`]) is shared. Only the dispatcher ever calls the blocking
//! receive; everyone else talks to the bus through [`crate::BusTx`].

pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canprobe_core::CanFrame;

use crate::config::TransportConfig;
use crate::error::TransportError;

/// Connection state of a transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    BusOff,
    Error,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Receive half of a transport. Exactly one owner: the dispatcher.
#[async_trait]
pub trait FrameSource: Send {
    /// Block up to `timeout` for one frame. `Ok(None)` means the window
    /// elapsed without traffic (not an error; the loop continues). Bus-off
    /// and driver faults return `Err` and mark the adapter disconnected.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;
}

/// Send half of a transport, shared by the scheduler and protocol stacks.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Enqueue a frame for transmission. Non-blocking from the caller's
    /// perspective; the adapter may serialize internally.
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Current adapter state.
    fn state(&self) -> LinkState;

    /// Tear down the adapter. Idempotent; subsequent sends fail with
    /// [`TransportError::Disconnected`].
    async fn shutdown(&self);
}

/// Open a transport from configuration, returning the split halves.
pub fn open_transport(
    config: &TransportConfig,
) -> Result<(Box<dyn FrameSource>, Arc<dyn FrameSink>), TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => socketcan::open(cfg),
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => {
            let bus = mock::MockBus::new();
            Ok(bus.attach_with_latency(Duration::from_micros(cfg.latency_us)))
        }
    }
}
