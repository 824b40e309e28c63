//! ISO 15765-2 transport: PCI codec and per-endpoint state machines
//!
//! `pdu` handles the wire format of the four frame types (SF/FF/CF/FC);
//! `endpoint` drives segmentation, reassembly and flow control for one
//! `(tx_id, rx_id)` pair.

pub mod endpoint;
pub mod pdu;

pub use endpoint::IsoTpEndpoint;
pub use pdu::{FlowStatus, Pci, MAX_PDU_LEN};
