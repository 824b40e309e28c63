//! SocketCAN raw adapter (Linux only)
//!
//! Uses two sockets on the same interface: one owned by the receive half,
//! one shared by the send half. All socket I/O runs on the blocking pool.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canprobe_core::{CanFrame, Direction};
use socketcan::{CanDataFrame, CanSocket, EmbeddedFrame, Frame, Socket};

use super::{FrameSink, FrameSource, LinkState};
use crate::config::SocketCanConfig;
use crate::error::TransportError;

pub fn open(
    cfg: &SocketCanConfig,
) -> Result<(Box<dyn FrameSource>, Arc<dyn FrameSink>), TransportError> {
    let rx = CanSocket::open(&cfg.interface).map_err(|e| {
        TransportError::InvalidConfig(format!("open {}: {}", cfg.interface, e))
    })?;
    let tx = CanSocket::open(&cfg.interface).map_err(|e| {
        TransportError::InvalidConfig(format!("open {}: {}", cfg.interface, e))
    })?;

    tracing::info!(interface = %cfg.interface, "SocketCAN transport opened");

    let source = SocketCanSource {
        socket: Arc::new(rx),
    };
    let sink = SocketCanSink {
        socket: Arc::new(tx),
        closed: AtomicBool::new(false),
    };
    Ok((Box::new(source), Arc::new(sink)))
}

fn is_link_down(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc_err) if libc_err == 100 /* ENETDOWN */ || libc_err == 19 /* ENODEV */
    )
}

fn frame_id(frame: &impl EmbeddedFrame) -> (u32, bool) {
    match frame.id() {
        socketcan::Id::Standard(id) => (id.as_raw() as u32, false),
        socketcan::Id::Extended(id) => (id.as_raw(), true),
    }
}

struct SocketCanSource {
    socket: Arc<CanSocket>,
}

#[async_trait]
impl FrameSource for SocketCanSource {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let socket = self.socket.clone();
        let result = tokio::task::spawn_blocking(move || socket.read_frame_timeout(timeout))
            .await
            .map_err(|e| TransportError::ReceiveFailed(format!("join: {e}")))?;

        match result {
            Ok(raw) => {
                let (id, extended) = frame_id(&raw);
                let mut frame = CanFrame::new(id, raw.data().to_vec());
                frame.extended = extended;
                frame.error = raw.is_error_frame();
                Ok(Some(frame))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) if is_link_down(&e) => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

struct SocketCanSink {
    socket: Arc<CanSocket>,
    closed: AtomicBool,
}

#[async_trait]
impl FrameSink for SocketCanSink {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        let id: socketcan::Id = if frame.extended {
            socketcan::ExtendedId::new(frame.id)
                .ok_or_else(|| {
                    TransportError::SendFailed(format!("invalid extended id 0x{:X}", frame.id))
                })?
                .into()
        } else {
            socketcan::StandardId::new(frame.id as u16)
                .ok_or_else(|| {
                    TransportError::SendFailed(format!("invalid standard id 0x{:X}", frame.id))
                })?
                .into()
        };
        let raw = CanDataFrame::new(id, &frame.data).ok_or_else(|| {
            TransportError::SendFailed(format!("payload too long: {} bytes", frame.data.len()))
        })?;
        debug_assert_eq!(frame.direction, Direction::Tx);

        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || socket.write_frame(&raw))
            .await
            .map_err(|e| TransportError::SendFailed(format!("join: {e}")))?
            .map_err(|e| {
                if is_link_down(&e) {
                    TransportError::Disconnected
                } else {
                    TransportError::SendFailed(e.to_string())
                }
            })
    }

    fn state(&self) -> LinkState {
        if self.closed.load(Ordering::SeqCst) {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        }
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
