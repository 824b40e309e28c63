//! Per-(tx_id, rx_id) ISO-TP endpoint
//!
//! Half-duplex request/response transport for PDUs up to 4095 bytes.
//! Frames arrive through the dispatcher inbox (never straight from the
//! transport); outbound frames go through [`BusTx`] so they are echoed
//! into the capture stream.
//!
//! Reception:
//! ```text
//! IDLE ──SF──▶ deliver, stay IDLE
//! IDLE ──FF──▶ allocate, send FC(CTS, BS, STmin) ──▶ RECEIVING
//! RECEIVING ──CF(expected)──▶ append; FC again after BS frames
//!           ──CF(wrong)────▶ reset, SequenceError
//!           ──N_Cr elapsed─▶ reset, TimeoutNCr
//! ```
//!
//! Transmission: SF for ≤ 7 bytes; otherwise FF, then blocks of CFs gated
//! by the peer's FlowControl (CTS/WAIT/OVFL, WAIT bounded by `wait_limit`).
//! Frames that arrive while a send is in flight still feed the receive
//! machine, so a full-duplex peer cannot wedge the endpoint.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use canprobe_bus::{BusTx, EndpointInbox, LinkState};
use canprobe_core::CanFrame;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::pdu::{self, FlowStatus, Pci, CF_PAYLOAD, FF_PAYLOAD, MAX_PDU_LEN, MAX_SF_PAYLOAD};
use crate::config::IsoTpConfig;
use crate::error::IsoTpError;

enum RxState {
    Idle,
    Receiving {
        buf: Vec<u8>,
        total_len: usize,
        expected_sn: u8,
        frames_since_fc: u8,
        deadline: Instant,
    },
}

pub struct IsoTpEndpoint {
    cfg: IsoTpConfig,
    bus: BusTx,
    inbox: EndpointInbox,
    link: watch::Receiver<LinkState>,
    rx: RxState,
    /// PDUs completed while a send was draining the inbox
    pending: VecDeque<Vec<u8>>,
    sequence_errors: u64,
    stray_consecutive: u64,
}

impl std::fmt::Debug for IsoTpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpEndpoint").field("cfg", &self.cfg).finish_non_exhaustive()
    }
}

impl IsoTpEndpoint {
    pub fn new(cfg: IsoTpConfig, bus: BusTx, inbox: EndpointInbox) -> Self {
        let link = bus.link_watch();
        Self {
            cfg,
            bus,
            inbox,
            link,
            rx: RxState::Idle,
            pending: VecDeque::new(),
            sequence_errors: 0,
            stray_consecutive: 0,
        }
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.cfg
    }

    /// Send handle this endpoint transmits through.
    pub fn bus(&self) -> &BusTx {
        &self.bus
    }

    /// Wrong-sequence aborts observed so far.
    pub fn sequence_errors(&self) -> u64 {
        self.sequence_errors
    }

    /// ConsecutiveFrames discarded because no transfer was in progress.
    pub fn stray_consecutive(&self) -> u64 {
        self.stray_consecutive
    }

    /// Frames dropped from the dispatcher inbox.
    pub fn inbox_overruns(&self) -> u64 {
        self.inbox.overruns()
    }

    /// Shared handle to the inbox overrun counter; stays readable after
    /// the endpoint moves into a worker task.
    pub fn overrun_handle(&self) -> Arc<AtomicU64> {
        self.inbox.overrun_handle()
    }

    fn ensure_connected(&self) -> Result<(), IsoTpError> {
        if self.link.borrow().is_connected() {
            Ok(())
        } else {
            Err(IsoTpError::Transport(
                canprobe_bus::TransportError::Disconnected,
            ))
        }
    }

    async fn send_frame(&self, frame: CanFrame) -> Result<(), IsoTpError> {
        match tokio::time::timeout(
            Duration::from_millis(self.cfg.n_as_ms),
            self.bus.send(frame),
        )
        .await
        {
            Ok(result) => result.map_err(IsoTpError::from),
            Err(_) => Err(IsoTpError::TimeoutNAs),
        }
    }

    /// Transmit one PDU. Resolves once the last frame is handed to the
    /// transport. Half-duplex: `&mut self` serializes sends per endpoint.
    pub async fn send_pdu(&mut self, payload: &[u8]) -> Result<(), IsoTpError> {
        if payload.is_empty() || payload.len() > MAX_PDU_LEN {
            return Err(IsoTpError::InvalidLength {
                len: payload.len(),
                max: MAX_PDU_LEN,
            });
        }
        self.ensure_connected()?;

        if payload.len() <= MAX_SF_PAYLOAD {
            trace!(len = payload.len(), "sending single frame");
            return self.send_frame(pdu::single_frame(&self.cfg, payload)).await;
        }

        debug!(len = payload.len(), "sending segmented PDU");
        self.send_frame(pdu::first_frame(&self.cfg, payload.len(), payload))
            .await?;

        let mut offset = FF_PAYLOAD;
        let mut sn: u8 = 1;
        'blocks: loop {
            let (block_size, st_min) = self.await_flow_control().await?;
            let gap = pdu::st_min_delay(st_min);
            let mut sent_in_block: u8 = 0;

            while offset < payload.len() {
                let chunk = (payload.len() - offset).min(CF_PAYLOAD);
                self.send_frame(pdu::consecutive_frame(
                    &self.cfg,
                    sn,
                    &payload[offset..offset + chunk],
                ))
                .await?;
                offset += chunk;
                sn = (sn + 1) & 0x0F;
                sent_in_block += 1;

                if offset >= payload.len() {
                    break 'blocks;
                }
                if block_size != 0 && sent_in_block == block_size {
                    // Block exhausted; the peer owes us another FC
                    continue 'blocks;
                }
                if !gap.is_zero() {
                    tokio::time::sleep(gap).await;
                }
            }
        }
        Ok(())
    }

    /// Wait for the peer's FlowControl, honoring WAIT up to `wait_limit`
    /// times. Non-FC traffic that arrives meanwhile feeds the receive
    /// machine.
    async fn await_flow_control(&mut self) -> Result<(u8, u8), IsoTpError> {
        let mut deadline = Instant::now() + Duration::from_millis(self.cfg.n_bs_ms);
        let mut waits: u8 = 0;

        loop {
            let frame = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Err(IsoTpError::TimeoutNBs),
                changed = self.link.changed() => {
                    if changed.is_err() || !self.link.borrow().is_connected() {
                        return Err(IsoTpError::Transport(
                            canprobe_bus::TransportError::Disconnected,
                        ));
                    }
                    continue;
                }
                frame = self.inbox.recv() => frame.ok_or(IsoTpError::Aborted)?,
            };

            match pdu::parse(&frame.data) {
                Ok(Pci::FlowControl {
                    status,
                    block_size,
                    st_min,
                }) => match status {
                    FlowStatus::ClearToSend => return Ok((block_size, st_min)),
                    FlowStatus::Wait => {
                        waits += 1;
                        if waits > self.cfg.wait_limit {
                            warn!(waits, "flow control WAIT limit exceeded");
                            return Err(IsoTpError::TimeoutNBs);
                        }
                        deadline = Instant::now() + Duration::from_millis(self.cfg.n_bs_ms);
                    }
                    FlowStatus::Overflow => return Err(IsoTpError::OverflowRemote),
                },
                Ok(other) => {
                    // Link layer is full duplex: a response PDU may start
                    // before our send finishes. Reassemble it on the side.
                    if let Some(completed) = self.feed_rx(other).await.unwrap_or_else(|e| {
                        warn!(error = %e, "receive error during send");
                        None
                    }) {
                        self.pending.push_back(completed);
                    }
                }
                Err(e) => warn!(error = %e, "ignoring malformed frame during send"),
            }
        }
    }

    /// Wait for the next complete PDU. Mid-reassembly silence is bounded
    /// by N_Cr; an idle endpoint waits indefinitely (callers wrap this in
    /// their own response timers).
    pub async fn recv_pdu(&mut self) -> Result<Vec<u8>, IsoTpError> {
        if let Some(pdu) = self.pending.pop_front() {
            return Ok(pdu);
        }

        loop {
            let cr_deadline = match &self.rx {
                RxState::Receiving { deadline, .. } => Some(*deadline),
                RxState::Idle => None,
            };

            let frame = tokio::select! {
                _ = async {
                    match cr_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.rx = RxState::Idle;
                    return Err(IsoTpError::TimeoutNCr);
                }
                changed = self.link.changed() => {
                    if changed.is_err() || !self.link.borrow().is_connected() {
                        // Discard any partial PDU; nothing gets delivered
                        self.rx = RxState::Idle;
                        return Err(IsoTpError::Transport(
                            canprobe_bus::TransportError::Disconnected,
                        ));
                    }
                    continue;
                }
                frame = self.inbox.recv() => frame.ok_or(IsoTpError::Aborted)?,
            };

            match pdu::parse(&frame.data) {
                Ok(pci) => {
                    if let Some(completed) = self.feed_rx(pci).await? {
                        return Ok(completed);
                    }
                }
                Err(e) => warn!(error = %e, "ignoring malformed frame"),
            }
        }
    }

    /// Advance the reception state machine by one frame. Returns a PDU on
    /// completion. Sequence errors reset to IDLE and surface.
    async fn feed_rx(&mut self, pci: Pci) -> Result<Option<Vec<u8>>, IsoTpError> {
        match pci {
            Pci::Single { payload } => {
                if matches!(self.rx, RxState::Receiving { .. }) {
                    warn!("single frame interrupted an in-progress reassembly");
                    self.rx = RxState::Idle;
                }
                Ok(Some(payload))
            }
            Pci::First { total_len, payload } => {
                if matches!(self.rx, RxState::Receiving { .. }) {
                    warn!("first frame interrupted an in-progress reassembly");
                }
                let mut buf = Vec::with_capacity(total_len);
                buf.extend_from_slice(&payload[..payload.len().min(FF_PAYLOAD)]);
                self.rx = RxState::Receiving {
                    buf,
                    total_len,
                    expected_sn: 1,
                    frames_since_fc: 0,
                    deadline: Instant::now() + Duration::from_millis(self.cfg.n_cr_ms),
                };
                self.send_frame(pdu::flow_control(
                    &self.cfg,
                    FlowStatus::ClearToSend,
                    self.cfg.block_size,
                    self.cfg.st_min,
                ))
                .await?;
                Ok(None)
            }
            Pci::Consecutive { sn, payload } => {
                let RxState::Receiving {
                    buf,
                    total_len,
                    expected_sn,
                    frames_since_fc,
                    deadline,
                } = &mut self.rx
                else {
                    // Stray CF: discard and count, stay IDLE
                    self.stray_consecutive += 1;
                    trace!(sn, "consecutive frame with no transfer in progress");
                    return Ok(None);
                };

                if sn != *expected_sn {
                    let expected = *expected_sn;
                    self.sequence_errors += 1;
                    self.rx = RxState::Idle;
                    warn!(expected, got = sn, "consecutive frame sequence error");
                    return Err(IsoTpError::Sequence { expected, got: sn });
                }

                let remaining = *total_len - buf.len();
                buf.extend_from_slice(&payload[..payload.len().min(remaining)]);
                *expected_sn = (*expected_sn + 1) & 0x0F;
                *frames_since_fc += 1;
                *deadline = Instant::now() + Duration::from_millis(self.cfg.n_cr_ms);

                if buf.len() >= *total_len {
                    let RxState::Receiving { buf, .. } =
                        std::mem::replace(&mut self.rx, RxState::Idle)
                    else {
                        unreachable!()
                    };
                    debug!(len = buf.len(), "PDU reassembled");
                    return Ok(Some(buf));
                }

                if self.cfg.block_size != 0 && *frames_since_fc >= self.cfg.block_size {
                    *frames_since_fc = 0;
                    self.send_frame(pdu::flow_control(
                        &self.cfg,
                        FlowStatus::ClearToSend,
                        self.cfg.block_size,
                        self.cfg.st_min,
                    ))
                    .await?;
                }
                Ok(None)
            }
            Pci::FlowControl { .. } => {
                // FC outside of a send is stale; ignore
                trace!("ignoring flow control outside transmission");
                Ok(None)
            }
        }
    }
}
