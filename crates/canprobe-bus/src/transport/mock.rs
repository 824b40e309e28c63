//! In-process virtual CAN bus
//!
//! [`MockBus`] is a hub any number of stations can attach to. A frame sent
//! by one station is seen by every other station, which is enough to run
//! the whole stack (dispatcher, ISO-TP, UDS) against a scripted peer in
//! tests without hardware. The hub can also simulate a cable pull.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canprobe_core::CanFrame;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::{FrameSink, FrameSource, LinkState};
use crate::error::TransportError;

const BUS_DEPTH: usize = 4096;

struct Hub {
    /// Frames on the wire, tagged with the sending station
    wire: broadcast::Sender<(u64, CanFrame)>,
    connected: watch::Sender<bool>,
    next_station: AtomicU64,
}

/// A shared virtual bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MockBus {
    hub: Arc<Hub>,
}

impl MockBus {
    pub fn new() -> Self {
        let (wire, _) = broadcast::channel(BUS_DEPTH);
        let (connected, _) = watch::channel(true);
        Self {
            hub: Arc::new(Hub {
                wire,
                connected,
                next_station: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a station; returns its transport halves.
    pub fn attach(&self) -> (Box<dyn FrameSource>, Arc<dyn FrameSink>) {
        self.attach_with_latency(Duration::ZERO)
    }

    /// Attach a station whose sends are delayed by `latency`.
    pub fn attach_with_latency(
        &self,
        latency: Duration,
    ) -> (Box<dyn FrameSource>, Arc<dyn FrameSink>) {
        let station = self.hub.next_station.fetch_add(1, Ordering::Relaxed);
        let source = MockSource {
            station,
            wire: self.hub.wire.subscribe(),
            connected: self.hub.connected.subscribe(),
        };
        let sink = MockSink {
            station,
            hub: self.hub.clone(),
            latency,
            closed: AtomicBool::new(false),
        };
        (Box::new(source), Arc::new(sink))
    }

    /// Simulate plugging/unplugging the cable for every station at once.
    pub fn set_connected(&self, connected: bool) {
        let _ = self.hub.connected.send(connected);
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

struct MockSource {
    station: u64,
    wire: broadcast::Receiver<(u64, CanFrame)>,
    connected: watch::Receiver<bool>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        if !*self.connected.borrow() {
            return Err(TransportError::Disconnected);
        }

        let deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                changed = self.connected.changed() => {
                    if changed.is_err() || !*self.connected.borrow() {
                        return Err(TransportError::Disconnected);
                    }
                }
                frame = self.wire.recv() => match frame {
                    // A station does not receive its own transmissions
                    Ok((station, frame)) if station != self.station => {
                        return Ok(Some(frame));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "mock bus receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TransportError::Disconnected);
                    }
                },
            }
        }
    }
}

struct MockSink {
    station: u64,
    hub: Arc<Hub>,
    latency: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || !*self.hub.connected.borrow() {
            return Err(TransportError::Disconnected);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        // No receivers is fine: an empty bus still accepts frames
        let _ = self.hub.wire.send((self.station, frame.clone()));
        Ok(())
    }

    fn state(&self) -> LinkState {
        if self.closed.load(Ordering::SeqCst) || !*self.hub.connected.borrow() {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        }
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stations_see_each_other_but_not_themselves() {
        let bus = MockBus::new();
        let (mut a_src, a_sink) = bus.attach();
        let (mut b_src, _b_sink) = bus.attach();

        a_sink.send(&CanFrame::new(0x123, vec![1, 2, 3])).await.unwrap();

        let frame = b_src.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.unwrap().id, 0x123);

        // The sender's own source stays quiet
        let echo = a_src.recv(Duration::from_millis(20)).await.unwrap();
        assert!(echo.is_none());
    }

    #[tokio::test]
    async fn recv_times_out_without_traffic() {
        let bus = MockBus::new();
        let (mut src, _sink) = bus.attach();
        let got = src.recv(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn disconnect_fails_both_halves() {
        let bus = MockBus::new();
        let (mut src, sink) = bus.attach();
        bus.set_connected(false);

        let err = src.recv(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
        let err = sink.send(&CanFrame::new(1, vec![])).await.unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
        assert_eq!(sink.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_local() {
        let bus = MockBus::new();
        let (_src, sink) = bus.attach();
        let (_src2, sink2) = bus.attach();

        sink.shutdown().await;
        sink.shutdown().await;
        assert_eq!(sink.state(), LinkState::Disconnected);
        // Other stations keep running
        assert_eq!(sink2.state(), LinkState::Connected);
        sink2.send(&CanFrame::new(2, vec![])).await.unwrap();
    }
}
