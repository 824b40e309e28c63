//! Frame dispatcher: the single receive loop and its fan-out
//!
//! Exactly one task calls the transport's blocking receive. Every frame it
//! pulls is stamped, pushed into the capture ring, published to observers
//! over a broadcast channel, and — when its ID matches a registered ISO-TP
//! endpoint — forwarded into that endpoint's bounded inbox. Observers and
//! endpoints that fall behind lose frames and count them; they never
//! back-pressure the receive loop.
//!
//! The send path lives here too: [`BusTx`] serializes transmissions through
//! the shared sink and echoes every sent frame back into the capture stream,
//! so the log shows both directions of a diagnostic exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canprobe_core::{CanFrame, Direction, FrameClock, FrameRing};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::BusConfig;
use crate::error::TransportError;
use crate::transport::{FrameSink, FrameSource, LinkState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The rx_id → endpoint mapping must stay injective.
    #[error("rx_id 0x{0:X} is already bound to an endpoint")]
    DuplicateRxId(u32),

    #[error("tx_id and rx_id must differ (both 0x{0:X})")]
    IdenticalIds(u32),
}

struct EndpointSlot {
    tx_id: u32,
    inbox: broadcast::Sender<CanFrame>,
}

struct Shared {
    sink: Arc<dyn FrameSink>,
    frames: broadcast::Sender<CanFrame>,
    ring: Arc<FrameRing>,
    clock: FrameClock,
    endpoints: RwLock<HashMap<u32, EndpointSlot>>,
    link: watch::Sender<LinkState>,
    inbox_capacity: usize,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
}

/// Shared send handle. All outbound traffic (scheduler, ISO-TP, UDS) goes
/// through here so sends are serialized and echoed into the capture.
#[derive(Clone)]
pub struct BusTx {
    shared: Arc<Shared>,
}

impl BusTx {
    /// Transmit a frame and echo it to observers with `Direction::Tx`.
    pub async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        let frame = frame.with_direction(Direction::Tx);
        trace!(
            id = format!("0x{:X}", frame.id),
            data = %hex::encode(&frame.data),
            "frame transmitted"
        );
        self.shared.sink.send(&frame).await?;

        let echo = frame.stamped(self.shared.clock.now_us());
        self.shared.ring.push(echo.clone());
        let _ = self.shared.frames.send(echo);
        self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current link state as last observed by the receive loop.
    pub fn link_state(&self) -> LinkState {
        *self.shared.link.borrow()
    }

    /// Watch for link state transitions.
    pub fn link_watch(&self) -> watch::Receiver<LinkState> {
        self.shared.link.subscribe()
    }
}

/// Observer subscription with drop accounting.
pub struct FrameObserver {
    rx: broadcast::Receiver<CanFrame>,
    dropped: u64,
}

impl FrameObserver {
    /// Next frame in transport-receive order. `None` once the dispatcher is
    /// gone. Frames missed while lagging are skipped and counted.
    pub async fn recv(&mut self) -> Option<CanFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Frames this observer has missed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Bounded per-endpoint inbox handed out by [`Dispatcher::register`].
///
/// Backed by a broadcast slot of `inbox_capacity` frames; once the reader
/// lags past that, the oldest pending frames are dropped and counted as
/// overruns. Dropping the inbox unregisters the endpoint.
pub struct EndpointInbox {
    pub tx_id: u32,
    pub rx_id: u32,
    rx: broadcast::Receiver<CanFrame>,
    overruns: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EndpointInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointInbox")
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .finish_non_exhaustive()
    }
}

impl EndpointInbox {
    /// Next frame addressed to this endpoint's rx_id, or `None` after the
    /// dispatcher shut down.
    pub async fn recv(&mut self) -> Option<CanFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.overruns.fetch_add(n, Ordering::Relaxed);
                    warn!(rx_id = format!("0x{:X}", self.rx_id), lost = n, "ISO-TP inbox overrun");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Frames dropped from this inbox so far.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Shared handle to the overrun counter, for owners that move the
    /// inbox into a worker task but still report the count.
    pub fn overrun_handle(&self) -> Arc<AtomicU64> {
        self.overruns.clone()
    }
}

impl Drop for EndpointInbox {
    fn drop(&mut self) {
        self.shared.endpoints.write().remove(&self.rx_id);
        debug!(rx_id = format!("0x{:X}", self.rx_id), "ISO-TP endpoint unregistered");
    }
}

/// Owns the receive loop and the fan-out state.
pub struct Dispatcher {
    shared: Arc<Shared>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Consume the receive half of a transport and start dispatching.
    ///
    /// Taking `source` by value is what enforces the single-receive-source
    /// rule: after this call nothing else can reach the blocking receive.
    pub fn spawn(
        source: Box<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        config: BusConfig,
    ) -> Self {
        let (frames, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (link, _) = watch::channel(LinkState::Connected);

        let shared = Arc::new(Shared {
            sink,
            frames,
            ring: Arc::new(FrameRing::new(config.ring_capacity)),
            clock: FrameClock::new(),
            endpoints: RwLock::new(HashMap::new()),
            link,
            inbox_capacity: config.inbox_capacity.max(1),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        });

        let recv_timeout = Duration::from_millis(config.recv_timeout_ms.max(1));
        let task = tokio::spawn(Self::recv_loop(source, shared.clone(), recv_timeout));

        Self {
            shared,
            recv_task: Mutex::new(Some(task)),
        }
    }

    async fn recv_loop(mut source: Box<dyn FrameSource>, shared: Arc<Shared>, timeout: Duration) {
        info!("dispatcher receive loop started");
        loop {
            match source.recv(timeout).await {
                Ok(Some(frame)) => {
                    let frame = if frame.is_stamped() {
                        frame
                    } else {
                        frame.stamped(shared.clock.now_us())
                    };
                    shared.frames_received.fetch_add(1, Ordering::Relaxed);
                    shared.ring.push(frame.clone());

                    // Fan out. Neither path blocks: broadcast drops for slow
                    // receivers, and endpoint inboxes shed their oldest frame.
                    let _ = shared.frames.send(frame.clone());
                    if let Some(slot) = shared.endpoints.read().get(&frame.id) {
                        let _ = slot.inbox.send(frame);
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    let state = match e {
                        TransportError::BusOff => LinkState::BusOff,
                        TransportError::Disconnected => LinkState::Disconnected,
                        _ => LinkState::Error,
                    };
                    warn!(error = %e, ?state, "transport receive failed, stopping dispatch");
                    let _ = shared.link.send(state);
                    break;
                }
            }
        }
        info!("dispatcher receive loop ended");
    }

    /// Send handle for the scheduler and protocol stacks.
    pub fn bus_tx(&self) -> BusTx {
        BusTx {
            shared: self.shared.clone(),
        }
    }

    /// Subscribe to the live frame stream.
    pub fn observe(&self) -> FrameObserver {
        FrameObserver {
            rx: self.shared.frames.subscribe(),
            dropped: 0,
        }
    }

    /// The capture history ring.
    pub fn ring(&self) -> Arc<FrameRing> {
        self.shared.ring.clone()
    }

    /// Bind an ISO-TP endpoint to `(tx_id, rx_id)`. Frames with `rx_id`
    /// are routed into the returned inbox.
    pub fn register(&self, tx_id: u32, rx_id: u32) -> Result<EndpointInbox, RegisterError> {
        if tx_id == rx_id {
            return Err(RegisterError::IdenticalIds(rx_id));
        }

        let mut endpoints = self.shared.endpoints.write();
        if endpoints.contains_key(&rx_id) {
            return Err(RegisterError::DuplicateRxId(rx_id));
        }

        let (inbox, rx) = broadcast::channel(self.shared.inbox_capacity);
        endpoints.insert(rx_id, EndpointSlot { tx_id, inbox });
        info!(
            tx_id = format!("0x{:X}", tx_id),
            rx_id = format!("0x{:X}", rx_id),
            "ISO-TP endpoint registered"
        );

        Ok(EndpointInbox {
            tx_id,
            rx_id,
            rx,
            overruns: Arc::new(AtomicU64::new(0)),
            shared: self.shared.clone(),
        })
    }

    /// Watch for link state transitions.
    pub fn link_watch(&self) -> watch::Receiver<LinkState> {
        self.shared.link.subscribe()
    }

    /// Frames pulled off the bus since start.
    pub fn frames_received(&self) -> u64 {
        self.shared.frames_received.load(Ordering::Relaxed)
    }

    /// Frames transmitted through [`BusTx`] since start.
    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    /// Stop the receive loop and close the transport. Idempotent.
    pub async fn shutdown(&self) {
        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = self.shared.link.send(LinkState::Disconnected);
            self.shared.sink.shutdown().await;
            info!("dispatcher shut down");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBus;

    fn dispatcher_on(bus: &MockBus) -> Dispatcher {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (source, sink) = bus.attach();
        Dispatcher::spawn(source, sink, BusConfig::default())
    }

    #[tokio::test]
    async fn frames_reach_observers_in_receive_order() {
        let bus = MockBus::new();
        let dispatcher = dispatcher_on(&bus);
        let mut observer = dispatcher.observe();

        let (_peer_src, peer_sink) = bus.attach();
        for i in 0..10u8 {
            peer_sink.send(&CanFrame::new(0x100 + i as u32, vec![i])).await.unwrap();
        }

        let mut last_ts = 0;
        for i in 0..10u8 {
            let frame = observer.recv().await.unwrap();
            assert_eq!(frame.id, 0x100 + i as u32);
            assert!(frame.timestamp_us >= last_ts);
            last_ts = frame.timestamp_us;
        }
        assert_eq!(dispatcher.frames_received(), 10);
    }

    #[tokio::test]
    async fn matching_frames_land_in_the_endpoint_inbox() {
        let bus = MockBus::new();
        let dispatcher = dispatcher_on(&bus);
        let mut inbox = dispatcher.register(0x7E0, 0x7E8).unwrap();

        let (_peer_src, peer_sink) = bus.attach();
        peer_sink.send(&CanFrame::new(0x123, vec![0])).await.unwrap();
        peer_sink.send(&CanFrame::new(0x7E8, vec![0x02, 0x50, 0x03])).await.unwrap();

        let frame = inbox.recv().await.unwrap();
        assert_eq!(frame.id, 0x7E8);
        assert_eq!(frame.data, vec![0x02, 0x50, 0x03]);
    }

    #[tokio::test]
    async fn duplicate_rx_id_is_rejected_until_unregistered() {
        let bus = MockBus::new();
        let dispatcher = dispatcher_on(&bus);

        let inbox = dispatcher.register(0x7E0, 0x7E8).unwrap();
        assert_eq!(
            dispatcher.register(0x700, 0x7E8).unwrap_err(),
            RegisterError::DuplicateRxId(0x7E8)
        );
        assert_eq!(
            dispatcher.register(0x7E8, 0x7E8).unwrap_err(),
            RegisterError::IdenticalIds(0x7E8)
        );

        drop(inbox);
        dispatcher.register(0x700, 0x7E8).unwrap();
    }

    #[tokio::test]
    async fn sends_are_echoed_into_the_capture() {
        let bus = MockBus::new();
        let dispatcher = dispatcher_on(&bus);
        let mut observer = dispatcher.observe();

        dispatcher
            .bus_tx()
            .send(CanFrame::new(0x7E0, vec![0x02, 0x10, 0x03]))
            .await
            .unwrap();

        let echo = observer.recv().await.unwrap();
        assert_eq!(echo.direction, Direction::Tx);
        assert_eq!(echo.id, 0x7E0);
        assert!(echo.is_stamped());
        assert_eq!(dispatcher.ring().len(), 1);
    }

    #[tokio::test]
    async fn sleeping_observer_does_not_stall_the_receive_loop() {
        let bus = MockBus::new();
        let dispatcher = dispatcher_on(&bus);
        // Subscribed but never reads: its backlog overflows, nothing else
        let _stuck = dispatcher.observe();

        let (_peer_src, peer_sink) = bus.attach();
        for i in 0..2000u32 {
            peer_sink.send(&CanFrame::new(0x200, vec![i as u8])).await.unwrap();
            if i % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(dispatcher.frames_received(), 2000);
    }

    #[tokio::test]
    async fn slow_observer_counts_its_drops() {
        let bus = MockBus::new();
        let (source, sink) = bus.attach();
        let dispatcher = Dispatcher::spawn(
            source,
            sink,
            BusConfig {
                broadcast_capacity: 16,
                ..Default::default()
            },
        );
        let mut observer = dispatcher.observe();

        let (_peer_src, peer_sink) = bus.attach();
        for i in 0..200u8 {
            peer_sink.send(&CanFrame::new(0x300, vec![i])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Drain what is left; the lag is recorded on first recv
        while tokio::time::timeout(Duration::from_millis(10), observer.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {}
        assert!(observer.dropped() > 0);
        assert_eq!(dispatcher.frames_received(), 200);
    }

    #[tokio::test]
    async fn transport_loss_publishes_disconnected_state() {
        let bus = MockBus::new();
        let dispatcher = dispatcher_on(&bus);
        let mut link = dispatcher.link_watch();
        assert_eq!(*link.borrow(), LinkState::Connected);

        bus.set_connected(false);
        link.changed().await.unwrap();
        assert_eq!(*link.borrow(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let bus = MockBus::new();
        let dispatcher = dispatcher_on(&bus);
        dispatcher.shutdown().await;
        dispatcher.shutdown().await;
        assert_eq!(*dispatcher.link_watch().borrow(), LinkState::Disconnected);
    }
}
