//! Bus-level configuration
//!
//! Everything the core needs to open a transport and run the dispatcher.
//! No process-wide state: two cores with two configs can drive two buses.

use serde::{Deserialize, Serialize};

/// Transport selection and parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// SocketCAN raw interface (Linux only, `socketcan` feature)
    SocketCan(SocketCanConfig),
    /// In-process virtual bus for tests and simulation
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// Interface name (e.g. "can0", "vcan0")
    pub interface: String,
    /// Nominal bitrate, informational only; interface setup is external
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_bitrate() -> u32 {
    500_000
}

/// Mock transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated per-frame latency in microseconds
    #[serde(default)]
    pub latency_us: u64,
}

/// Dispatcher and capture parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Blocking receive window for the single receive loop (milliseconds).
    /// Also bounds shutdown latency of that loop.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    /// Frame history ring capacity
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Broadcast channel depth for observers; slow observers lose frames
    /// beyond this backlog
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Per-endpoint ISO-TP inbox depth; overflow drops the oldest pending
    /// frame and records an overrun
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            recv_timeout_ms: default_recv_timeout_ms(),
            ring_capacity: default_ring_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

fn default_recv_timeout_ms() -> u64 {
    100
}

fn default_ring_capacity() -> usize {
    10_000
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_inbox_capacity() -> usize {
    64
}
