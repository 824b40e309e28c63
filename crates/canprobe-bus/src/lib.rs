//! canprobe-bus - CAN transport, dispatch and transmit scheduling
//!
//! This crate owns everything between the raw CAN device and the protocol
//! layers above:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       Dispatcher                          │
//! │  single receive loop over the (move-only) FrameSource     │
//! │                                                           │
//! │   frame ──▶ stamp ──▶ ring buffer                         │
//! │                  ├──▶ broadcast to observers              │
//! │                  └──▶ per-endpoint inbox (rx_id match)    │
//! │                                                           │
//! │   BusTx: serialized send path + TX echo into the capture  │
//! └───────────────────────────────────────────────────────────┘
//!          ▲                                   ▲
//!   TxScheduler (periodic/burst)        ISO-TP / UDS (canprobe-uds)
//! ```
//!
//! The `FrameSource` half of a transport is consumed by value when the
//! dispatcher is spawned. That makes the single-receive-source rule a type
//! system property: nothing else can ever call the blocking receive, so a
//! running UDS stack cannot starve the logger (or vice versa).

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod scheduler;
pub mod transport;

pub use config::{BusConfig, TransportConfig};
pub use dispatcher::{BusTx, Dispatcher, EndpointInbox, FrameObserver, RegisterError};
pub use error::TransportError;
pub use scheduler::{JobId, SchedulerError, TxScheduler};
pub use transport::{open_transport, FrameSink, FrameSource, LinkState};
