//! canprobe-uds - diagnostic protocol layers of the canprobe analyzer core
//!
//! Builds ISO 15765-2 (ISO-TP) transport and an ISO 14229 (UDS) client on
//! top of the frame plumbing in `canprobe-bus`:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      AnalyzerCore                        │
//! │  connect / disconnect, endpoint registry, scheduler,     │
//! │  codec attachment                                        │
//! │                                                          │
//! │  ┌────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │ UdsClient  │──▶│ IsoTpEndpoint│──▶│ BusTx / inbox │  │
//! │  │ (services, │   │ (segmenting, │   │ (canprobe-bus)│  │
//! │  │  session,  │   │  reassembly, │   └───────────────┘  │
//! │  │  keepalive)│   │  flow ctrl)  │                      │
//! │  └─────┬──────┘   └──────────────┘                      │
//! │        │ seed/key                                       │
//! │  ┌─────▼──────┐                                         │
//! │  │ SeedKey    │  xor / add / complement / crc16 /       │
//! │  │ engine     │  external provider (500 ms bound)       │
//! │  └────────────┘                                         │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod analyzer;
pub mod config;
pub mod error;
pub mod isotp;
pub mod security;
pub mod uds;

pub use analyzer::{AnalyzerCore, CoreConfig};
pub use config::{IsoTpConfig, UdsClientConfig};
pub use error::{IsoTpError, SecurityError, UdsError};
pub use isotp::IsoTpEndpoint;
pub use security::{SeedKeyAlgorithm, SeedKeyProvider};
pub use uds::{
    NegativeResponseCode, UdsClient, UdsEvent, UdsRequest, UdsResponse, UdsSession,
};
