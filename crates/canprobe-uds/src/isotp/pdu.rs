//! ISO-TP protocol control information (N_PCI) codec
//!
//! First nibble of byte 0 selects the frame type:
//! `0x0_` SingleFrame, `0x1_` FirstFrame, `0x2_` ConsecutiveFrame,
//! `0x3_` FlowControl.

use std::time::Duration;

use canprobe_core::CanFrame;

use crate::config::IsoTpConfig;
use crate::error::IsoTpError;

/// Largest PDU ISO-TP can carry (12-bit FirstFrame length).
pub const MAX_PDU_LEN: usize = 4095;

/// Payload bytes a SingleFrame can carry on classic CAN.
pub const MAX_SF_PAYLOAD: usize = 7;
/// Payload bytes the FirstFrame carries.
pub const FF_PAYLOAD: usize = 6;
/// Payload bytes per ConsecutiveFrame.
pub const CF_PAYLOAD: usize = 7;

const PCI_SF: u8 = 0x0;
const PCI_FF: u8 = 0x1;
const PCI_CF: u8 = 0x2;
const PCI_FC: u8 = 0x3;

/// FlowControl status nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ClearToSend,
    Wait,
    Overflow,
}

/// Parsed N_PCI of one received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pci {
    Single {
        payload: Vec<u8>,
    },
    First {
        total_len: usize,
        payload: Vec<u8>,
    },
    Consecutive {
        sn: u8,
        payload: Vec<u8>,
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    },
}

/// Decode the PCI of a received frame. Padding past the declared lengths
/// is ignored, as peers pad to full DLC.
pub fn parse(data: &[u8]) -> Result<Pci, IsoTpError> {
    let first = *data
        .first()
        .ok_or_else(|| IsoTpError::InvalidFrame("empty frame".to_string()))?;

    match first >> 4 {
        PCI_SF => {
            let len = (first & 0x0F) as usize;
            if len == 0 || len > MAX_SF_PAYLOAD {
                return Err(IsoTpError::InvalidFrame(format!(
                    "single frame length nibble {len}"
                )));
            }
            if data.len() < 1 + len {
                return Err(IsoTpError::InvalidFrame(format!(
                    "single frame declares {len} bytes, frame has {}",
                    data.len() - 1
                )));
            }
            Ok(Pci::Single {
                payload: data[1..1 + len].to_vec(),
            })
        }
        PCI_FF => {
            if data.len() < 2 {
                return Err(IsoTpError::InvalidFrame("first frame too short".to_string()));
            }
            let total_len = (((first & 0x0F) as usize) << 8) | data[1] as usize;
            // Lengths that fit a single frame (or exceed the 12-bit field)
            // are not valid FirstFrames
            if !(FF_PAYLOAD + 2..=MAX_PDU_LEN).contains(&total_len) {
                return Err(IsoTpError::InvalidFrame(format!(
                    "first frame length {total_len}"
                )));
            }
            Ok(Pci::First {
                total_len,
                payload: data[2..].to_vec(),
            })
        }
        PCI_CF => {
            if data.len() < 2 {
                return Err(IsoTpError::InvalidFrame(
                    "consecutive frame without payload".to_string(),
                ));
            }
            Ok(Pci::Consecutive {
                sn: first & 0x0F,
                payload: data[1..].to_vec(),
            })
        }
        PCI_FC => {
            if data.len() < 3 {
                return Err(IsoTpError::InvalidFrame("flow control too short".to_string()));
            }
            let status = match first & 0x0F {
                0 => FlowStatus::ClearToSend,
                1 => FlowStatus::Wait,
                2 => FlowStatus::Overflow,
                other => {
                    return Err(IsoTpError::InvalidFrame(format!(
                        "flow control status {other}"
                    )))
                }
            };
            Ok(Pci::FlowControl {
                status,
                block_size: data[1],
                st_min: data[2],
            })
        }
        _ => unreachable!("nibble is masked to 0..=15"),
    }
}

/// Minimum spacing requested by an STmin byte. Reserved values are read as
/// the maximum (127 ms), per ISO 15765-2.
pub fn st_min_delay(st_min: u8) -> Duration {
    match st_min {
        0x00..=0x7F => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min - 0xF0) as u64 * 100),
        _ => Duration::from_millis(127),
    }
}

fn finish(cfg: &IsoTpConfig, mut bytes: Vec<u8>) -> CanFrame {
    if cfg.fd {
        // CAN-FD uses the smallest valid DLC >= payload
        const FD_SIZES: [usize; 8] = [8, 12, 16, 20, 24, 32, 48, 64];
        if bytes.len() > 8 {
            let target = FD_SIZES
                .iter()
                .copied()
                .find(|&s| s >= bytes.len())
                .unwrap_or(64);
            bytes.resize(target, cfg.padding);
        }
        let mut frame = CanFrame::new_fd(cfg.tx_id, bytes);
        frame.extended = cfg.tx_id > 0x7FF;
        frame
    } else {
        // Classic CAN is always padded to DLC 8
        bytes.resize(CanFrame::MAX_CLASSIC_DLC, cfg.padding);
        CanFrame::new(cfg.tx_id, bytes)
    }
}

/// Build a SingleFrame; `payload` must be 1..=7 bytes.
pub fn single_frame(cfg: &IsoTpConfig, payload: &[u8]) -> CanFrame {
    debug_assert!((1..=MAX_SF_PAYLOAD).contains(&payload.len()));
    let mut bytes = Vec::with_capacity(8);
    bytes.push(payload.len() as u8);
    bytes.extend_from_slice(payload);
    finish(cfg, bytes)
}

/// Build the FirstFrame of a `total_len`-byte PDU; carries the first 6
/// payload bytes.
pub fn first_frame(cfg: &IsoTpConfig, total_len: usize, payload: &[u8]) -> CanFrame {
    debug_assert!((FF_PAYLOAD + 2..=MAX_PDU_LEN).contains(&total_len));
    let mut bytes = Vec::with_capacity(8);
    bytes.push((PCI_FF << 4) | ((total_len >> 8) as u8 & 0x0F));
    bytes.push(total_len as u8);
    bytes.extend_from_slice(&payload[..FF_PAYLOAD]);
    finish(cfg, bytes)
}

/// Build a ConsecutiveFrame with sequence number `sn` (low nibble).
pub fn consecutive_frame(cfg: &IsoTpConfig, sn: u8, chunk: &[u8]) -> CanFrame {
    debug_assert!((1..=CF_PAYLOAD).contains(&chunk.len()));
    let mut bytes = Vec::with_capacity(8);
    bytes.push((PCI_CF << 4) | (sn & 0x0F));
    bytes.extend_from_slice(chunk);
    finish(cfg, bytes)
}

/// Build a FlowControl frame.
pub fn flow_control(cfg: &IsoTpConfig, status: FlowStatus, block_size: u8, st_min: u8) -> CanFrame {
    let status_nibble = match status {
        FlowStatus::ClearToSend => 0,
        FlowStatus::Wait => 1,
        FlowStatus::Overflow => 2,
    };
    finish(cfg, vec![(PCI_FC << 4) | status_nibble, block_size, st_min])
}
