//! Analyzer core: the control surface over one CAN bus
//!
//! Composes the transport, dispatcher, scheduler and protocol layers into
//! the single object collaborators (GUI, CLI, scripting) talk to. Holds
//! no references to presentation code: observers subscribe to channels
//! and tear down by dropping their handles. Multiple cores may coexist,
//! one per physical bus.

use std::collections::BTreeMap;
use std::sync::Arc;

use canprobe_bus::{
    open_transport, BusConfig, BusTx, Dispatcher, FrameObserver, FrameSink, FrameSource,
    LinkState, RegisterError, TransportConfig, TransportError, TxScheduler,
};
use canprobe_core::{CanFrame, CodecError, EncodedMessage, FrameRing, SignalCodec};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{IsoTpConfig, UdsClientConfig};
use crate::isotp::IsoTpEndpoint;
use crate::uds::UdsClient;

/// Full configuration for one analyzer core instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub bus: BusConfig,
    /// Defaults applied to UDS clients opened through this core
    #[serde(default)]
    pub uds: UdsClientConfig,
}

/// One connected analyzer core.
pub struct AnalyzerCore {
    dispatcher: Dispatcher,
    scheduler: TxScheduler,
    uds_defaults: UdsClientConfig,
    codec: RwLock<Option<Arc<dyn SignalCodec>>>,
}

impl AnalyzerCore {
    /// Open the configured transport and start the dispatcher and
    /// scheduler.
    pub fn connect(config: CoreConfig) -> Result<Self, TransportError> {
        let (source, sink) = open_transport(&config.transport)?;
        Ok(Self::connect_split(source, sink, config))
    }

    /// Start on an already-open transport pair (tests, custom adapters).
    pub fn connect_split(
        source: Box<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        config: CoreConfig,
    ) -> Self {
        let dispatcher = Dispatcher::spawn(source, sink, config.bus);
        let scheduler = TxScheduler::spawn(dispatcher.bus_tx(), dispatcher.link_watch());
        info!("analyzer core connected");
        Self {
            dispatcher,
            scheduler,
            uds_defaults: config.uds,
            codec: RwLock::new(None),
        }
    }

    /// Stop scheduler and dispatcher and close the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.scheduler.shutdown();
        self.dispatcher.shutdown().await;
        info!("analyzer core disconnected");
    }

    /// Subscribe to the live frame stream (RX and TX echo).
    pub fn observe(&self) -> FrameObserver {
        self.dispatcher.observe()
    }

    /// Recent frame history.
    pub fn ring(&self) -> Arc<FrameRing> {
        self.dispatcher.ring()
    }

    /// Shared send handle.
    pub fn bus_tx(&self) -> BusTx {
        self.dispatcher.bus_tx()
    }

    /// The transmit scheduler (single-shot, burst, periodic jobs).
    pub fn scheduler(&self) -> &TxScheduler {
        &self.scheduler
    }

    pub fn link_state(&self) -> LinkState {
        self.dispatcher.bus_tx().link_state()
    }

    /// Frames received / transmitted since connect.
    pub fn frame_counts(&self) -> (u64, u64) {
        (
            self.dispatcher.frames_received(),
            self.dispatcher.frames_sent(),
        )
    }

    /// Bind a raw ISO-TP endpoint (no UDS client on top).
    pub fn open_endpoint(&self, cfg: IsoTpConfig) -> Result<IsoTpEndpoint, RegisterError> {
        let inbox = self.dispatcher.register(cfg.tx_id, cfg.rx_id)?;
        Ok(IsoTpEndpoint::new(cfg, self.dispatcher.bus_tx(), inbox))
    }

    /// Bind an ISO-TP endpoint and start a UDS client on it, using this
    /// core's default UDS timing.
    pub fn open_uds_client(&self, cfg: IsoTpConfig) -> Result<UdsClient, RegisterError> {
        self.open_uds_client_with(cfg, self.uds_defaults.clone())
    }

    /// Same as [`Self::open_uds_client`] with explicit client settings.
    pub fn open_uds_client_with(
        &self,
        cfg: IsoTpConfig,
        uds: UdsClientConfig,
    ) -> Result<UdsClient, RegisterError> {
        let endpoint = self.open_endpoint(cfg)?;
        Ok(UdsClient::spawn(endpoint, uds))
    }

    /// Attach (or replace) the external signal database.
    pub fn attach_codec(&self, codec: Arc<dyn SignalCodec>) {
        *self.codec.write() = Some(codec);
    }

    /// Detach the signal database.
    pub fn detach_codec(&self) {
        *self.codec.write() = None;
    }

    /// Decode a frame through the attached database. `None` when no
    /// database is attached or the frame is not covered.
    pub fn decode(&self, frame: &CanFrame) -> Option<BTreeMap<String, f64>> {
        self.codec.read().as_ref()?.decode(frame)
    }

    /// Encode named signals through the attached database.
    pub fn encode(
        &self,
        message: &str,
        signals: &BTreeMap<String, f64>,
    ) -> Result<EncodedMessage, CodecError> {
        match self.codec.read().as_ref() {
            Some(codec) => codec.encode(message, signals),
            None => Err(CodecError::UnknownMessage(format!(
                "{message} (no database attached)"
            ))),
        }
    }
}
