//! canprobe-core - shared value types for the canprobe analyzer core
//!
//! This crate holds the pieces every other layer agrees on: the immutable
//! [`CanFrame`] value, the bounded [`FrameRing`] that backs the live capture
//! view, the monotonic [`FrameClock`] used to stamp frames on ingress, and
//! the [`SignalCodec`] seam through which an external message database
//! converts between frames and named signal values.
//!
//! Nothing in here talks to hardware or spawns tasks; that lives in
//! `canprobe-bus` (transport, dispatch, scheduling) and `canprobe-uds`
//! (ISO-TP and the UDS client).

pub mod codec;
pub mod frame;
pub mod ring;

pub use codec::{CodecError, EncodedMessage, SignalCodec};
pub use frame::{CanFrame, Direction, FrameClock};
pub use ring::FrameRing;
