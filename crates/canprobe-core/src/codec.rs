//! Decode/encode seam to an external message database
//!
//! The analyzer core never interprets DBC (or any other database) semantics
//! itself. When a database is attached, frames are routed through this
//! interface; implementations live outside the core.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::frame::CanFrame;

/// A message encoded back into bus representation.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    #[error("unknown signal '{signal}' in message '{message}'")]
    UnknownSignal { message: String, signal: String },

    #[error("signal value out of range: {0}")]
    OutOfRange(String),
}

/// Signal ↔ bytes conversion against an attached message database.
///
/// `decode` returns `None` for frames the database does not cover; that is
/// not an error, most bus traffic is simply not described.
pub trait SignalCodec: Send + Sync {
    /// Decode a frame into named physical signal values.
    fn decode(&self, frame: &CanFrame) -> Option<BTreeMap<String, f64>>;

    /// Encode named signal values into a transmittable message.
    fn encode(
        &self,
        message: &str,
        signals: &BTreeMap<String, f64>,
    ) -> Result<EncodedMessage, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-message codec: "Speed" = one little-endian u16 in bytes 0..2
    /// of ID 0x100, scaled by 0.1.
    struct SpeedCodec;

    impl SignalCodec for SpeedCodec {
        fn decode(&self, frame: &CanFrame) -> Option<BTreeMap<String, f64>> {
            if frame.id != 0x100 || frame.data.len() < 2 {
                return None;
            }
            let raw = u16::from_le_bytes([frame.data[0], frame.data[1]]);
            let mut signals = BTreeMap::new();
            signals.insert("Speed".to_string(), raw as f64 * 0.1);
            Some(signals)
        }

        fn encode(
            &self,
            message: &str,
            signals: &BTreeMap<String, f64>,
        ) -> Result<EncodedMessage, CodecError> {
            if message != "Vehicle" {
                return Err(CodecError::UnknownMessage(message.to_string()));
            }
            let speed = signals.get("Speed").ok_or_else(|| CodecError::UnknownSignal {
                message: message.to_string(),
                signal: "Speed".to_string(),
            })?;
            let raw = (speed / 0.1).round();
            if !(0.0..=u16::MAX as f64).contains(&raw) {
                return Err(CodecError::OutOfRange(format!("Speed = {speed}")));
            }
            Ok(EncodedMessage {
                id: 0x100,
                extended: false,
                data: (raw as u16).to_le_bytes().to_vec(),
            })
        }
    }

    #[test]
    fn encode_inverts_decode_for_covered_frames() {
        let codec = SpeedCodec;
        let frame = CanFrame::new(0x100, vec![0x10, 0x27]); // 10000 raw = 1000.0
        let signals = codec.decode(&frame).expect("covered frame decodes");
        let encoded = codec.encode("Vehicle", &signals).unwrap();
        assert_eq!(encoded.id, frame.id);
        assert_eq!(encoded.extended, frame.extended);
        assert_eq!(encoded.data, frame.data);
    }

    #[test]
    fn uncovered_frames_decode_to_none() {
        assert!(SpeedCodec.decode(&CanFrame::new(0x200, vec![1, 2])).is_none());
    }

    #[test]
    fn unknown_message_is_an_error() {
        let err = SpeedCodec.encode("Nope", &BTreeMap::new()).unwrap_err();
        assert_eq!(err, CodecError::UnknownMessage("Nope".to_string()));
    }
}
