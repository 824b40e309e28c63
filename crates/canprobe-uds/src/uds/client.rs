//! UDS client: request FIFO, response matching and service wrappers
//!
//! One worker task per endpoint owns the ISO-TP endpoint and processes
//! requests strictly in submission order, one outstanding at a time. The
//! worker also drives the tester-present keepalive so keepalive frames
//! never interleave with a request's flow-control exchange.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{service_id, session_type, NegativeResponseCode, UdsSession, TESTER_PRESENT_SUPPRESS};
use crate::config::UdsClientConfig;
use crate::error::{SecurityError, UdsError};
use crate::isotp::{pdu, IsoTpEndpoint};
use crate::security::SeedKeyAlgorithm;

/// Consecutive keepalive failures tolerated before the session is demoted
/// to default.
const TESTER_PRESENT_MAX_FAILURES: u32 = 3;

/// A raw UDS request.
#[derive(Debug, Clone)]
pub struct UdsRequest {
    pub service: u8,
    pub sub_function: Option<u8>,
    pub payload: Vec<u8>,
    /// P2 override, milliseconds (client default when `None`)
    pub timeout_ms: Option<u64>,
    /// P2* override, milliseconds (client default when `None`)
    pub p2_ext_ms: Option<u64>,
}

impl UdsRequest {
    pub fn new(service: u8) -> Self {
        Self {
            service,
            sub_function: None,
            payload: Vec::new(),
            timeout_ms: None,
            p2_ext_ms: None,
        }
    }

    pub fn sub_function(mut self, sub: u8) -> Self {
        self.sub_function = Some(sub);
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    fn service_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.payload.len());
        bytes.push(self.service);
        if let Some(sub) = self.sub_function {
            bytes.push(sub);
        }
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Classified UDS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// `service` is the response SID (request SID + 0x40); `payload` is
    /// everything after it.
    Positive { service: u8, payload: Vec<u8> },
    Negative {
        service: u8,
        nrc: NegativeResponseCode,
    },
}

impl UdsResponse {
    /// Positive payload, or the negative response as an error.
    pub fn positive(self) -> Result<Vec<u8>, UdsError> {
        match self {
            Self::Positive { payload, .. } => Ok(payload),
            Self::Negative { service, nrc } => Err(UdsError::Negative { service, nrc }),
        }
    }
}

/// Completion event published for observers, keyed by correlation id.
#[derive(Debug, Clone)]
pub struct UdsEvent {
    pub correlation_id: u64,
    pub service: u8,
    pub result: Result<UdsResponse, UdsError>,
}

struct Exchange {
    request: Vec<u8>,
    service: u8,
    p2: Duration,
    p2_ext: Duration,
    correlation_id: u64,
    reply: oneshot::Sender<Result<UdsResponse, UdsError>>,
}

/// UDS client handle. Clones share the worker, the FIFO and the session
/// state.
#[derive(Clone)]
pub struct UdsClient {
    cmd: mpsc::Sender<Exchange>,
    session: Arc<RwLock<UdsSession>>,
    events: broadcast::Sender<UdsEvent>,
    correlation: Arc<AtomicU64>,
    config: UdsClientConfig,
    tp_enabled: Arc<watch::Sender<bool>>,
    inbox_overruns: Arc<AtomicU64>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl UdsClient {
    /// Spawn a client worker that owns `endpoint`.
    pub fn spawn(endpoint: IsoTpEndpoint, config: UdsClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_depth.max(1));
        let (events, _) = broadcast::channel(256);
        let session = Arc::new(RwLock::new(UdsSession::default()));
        let tp_enabled = Arc::new(watch::channel(false).0);
        let inbox_overruns = endpoint.overrun_handle();

        let worker = tokio::spawn(run_worker(
            endpoint,
            cmd_rx,
            events.clone(),
            session.clone(),
            config.clone(),
            tp_enabled.clone(),
        ));

        Self {
            cmd: cmd_tx,
            session,
            events,
            correlation: Arc::new(AtomicU64::new(1)),
            config,
            tp_enabled,
            inbox_overruns,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Snapshot of the session/security state.
    pub fn session(&self) -> UdsSession {
        self.session.read().clone()
    }

    /// Subscribe to request completion events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<UdsEvent> {
        self.events.subscribe()
    }

    /// Frames dropped from this endpoint's dispatcher inbox so far.
    pub fn inbox_overruns(&self) -> u64 {
        self.inbox_overruns.load(Ordering::Relaxed)
    }

    /// Submit a raw request and await its classified response.
    ///
    /// Requests on one endpoint are answered in submission order; a full
    /// queue rejects synchronously with [`UdsError::QueueFull`].
    pub async fn request(&self, request: UdsRequest) -> Result<UdsResponse, UdsError> {
        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = Exchange {
            request: request.service_bytes(),
            service: request.service,
            p2: Duration::from_millis(request.timeout_ms.unwrap_or(self.config.p2_ms)),
            p2_ext: Duration::from_millis(request.p2_ext_ms.unwrap_or(self.config.p2_ext_ms)),
            correlation_id,
            reply: reply_tx,
        };

        self.cmd.try_send(exchange).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => UdsError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => UdsError::Cancelled,
        })?;

        // A dropped reply means the worker went away mid-request
        reply_rx.await.unwrap_or(Err(UdsError::Cancelled))
    }

    /// DiagnosticSessionControl (0x10). Returns the session parameter
    /// record (P2/P2* timing bytes) from the positive response.
    pub async fn session_control(&self, session: u8) -> Result<Vec<u8>, UdsError> {
        let payload = self
            .request(UdsRequest::new(service_id::DIAGNOSTIC_SESSION_CONTROL).sub_function(session))
            .await?
            .positive()?;

        {
            let mut state = self.session.write();
            state.enter_session(session);
            state.tester_present_enabled =
                session != session_type::DEFAULT && self.config.tester_present.enabled;
        }
        let keepalive = self.session.read().tester_present_enabled;
        let _ = self.tp_enabled.send(keepalive);
        info!(
            session = format!("0x{:02X}", session),
            keepalive, "diagnostic session changed"
        );

        // Strip the sub-function echo
        Ok(payload.get(1..).unwrap_or_default().to_vec())
    }

    /// SecurityAccess (0x27): request the seed for odd `level`, compute
    /// the key with `algorithm`, send it on `level + 1`.
    ///
    /// An all-zero (or empty) seed means the level is already unlocked;
    /// the key step is skipped. Invalid-key and exceeded-attempts NRCs
    /// surface without touching the recorded level.
    pub async fn security_access(
        &self,
        level: u8,
        algorithm: &SeedKeyAlgorithm,
    ) -> Result<(), UdsError> {
        if level == 0 || level % 2 == 0 {
            return Err(SecurityError::InvalidLevel(level).into());
        }

        let payload = self
            .request(UdsRequest::new(service_id::SECURITY_ACCESS).sub_function(level))
            .await?
            .positive()?;
        let seed = payload.get(1..).unwrap_or_default().to_vec();

        if seed.is_empty() || seed.iter().all(|&b| b == 0) {
            let mut state = self.session.write();
            state.security_level = level;
            state.pending_seed = None;
            debug!(level, "zero seed: already unlocked");
            return Ok(());
        }

        self.session.write().pending_seed = Some((level, seed.clone()));
        let key = algorithm.compute(level, &seed).await?;

        let result = self
            .request(
                UdsRequest::new(service_id::SECURITY_ACCESS)
                    .sub_function(level + 1)
                    .payload(key),
            )
            .await?
            .positive();

        match result {
            Ok(_) => {
                let mut state = self.session.write();
                state.security_level = level;
                state.pending_seed = None;
                info!(level, "security access unlocked");
                Ok(())
            }
            // 0x35 invalid key / 0x36 exceeded attempts: level unchanged
            Err(err) => {
                self.session.write().pending_seed = None;
                Err(err)
            }
        }
    }

    /// ReadDataByIdentifier (0x22). Returns the record data with the DID
    /// echo stripped.
    pub async fn read_did(&self, did: u16) -> Result<Vec<u8>, UdsError> {
        let payload = self
            .request(UdsRequest::new(service_id::READ_DATA_BY_ID).payload(did.to_be_bytes()))
            .await?
            .positive()?;

        if payload.len() < 2 || payload[..2] != did.to_be_bytes() {
            return Err(UdsError::ProtocolViolation(format!(
                "0x22 response does not echo DID 0x{did:04X}"
            )));
        }
        Ok(payload[2..].to_vec())
    }

    /// WriteDataByIdentifier (0x2E).
    pub async fn write_did(&self, did: u16, data: &[u8]) -> Result<(), UdsError> {
        let mut request_payload = did.to_be_bytes().to_vec();
        request_payload.extend_from_slice(data);
        let payload = self
            .request(UdsRequest::new(service_id::WRITE_DATA_BY_ID).payload(request_payload))
            .await?
            .positive()?;

        if payload.len() < 2 || payload[..2] != did.to_be_bytes() {
            return Err(UdsError::ProtocolViolation(format!(
                "0x2E response does not echo DID 0x{did:04X}"
            )));
        }
        Ok(())
    }

    /// ReadDTCInformation (0x19). Returns the response record after the
    /// SID (sub-function echo included, as DTC parsing is sub-function
    /// specific).
    pub async fn read_dtc(&self, sub_function: u8, status_mask: u8) -> Result<Vec<u8>, UdsError> {
        self.request(
            UdsRequest::new(service_id::READ_DTC_INFO)
                .sub_function(sub_function)
                .payload([status_mask]),
        )
        .await?
        .positive()
    }

    /// ClearDiagnosticInformation (0x14) for a 3-byte DTC group
    /// (0xFFFFFF = all).
    pub async fn clear_dtc(&self, group: u32) -> Result<(), UdsError> {
        let group_bytes = group.to_be_bytes();
        self.request(
            UdsRequest::new(service_id::CLEAR_DIAGNOSTIC_INFO).payload(vec![
                group_bytes[1],
                group_bytes[2],
                group_bytes[3],
            ]),
        )
        .await?
        .positive()?;
        Ok(())
    }

    /// RoutineControl (0x31). Returns the routine status record.
    pub async fn routine_control(
        &self,
        sub_function: u8,
        routine_id: u16,
        params: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut request_payload = routine_id.to_be_bytes().to_vec();
        request_payload.extend_from_slice(params);
        let payload = self
            .request(
                UdsRequest::new(service_id::ROUTINE_CONTROL)
                    .sub_function(sub_function)
                    .payload(request_payload),
            )
            .await?
            .positive()?;

        if payload.len() < 3 {
            return Err(UdsError::ProtocolViolation(
                "0x31 response shorter than sub-function + RID".to_string(),
            ));
        }
        Ok(payload[3..].to_vec())
    }

    /// ECUReset (0x11). The ECU may reboot before answering, so a
    /// timeout or transport loss after the request counts as success;
    /// local state returns to default session, locked.
    pub async fn ecu_reset(&self, reset_type: u8) -> Result<(), UdsError> {
        let result = self
            .request(UdsRequest::new(service_id::ECU_RESET).sub_function(reset_type))
            .await;

        match result {
            Ok(response) => {
                response.positive()?;
            }
            Err(UdsError::Timeout) | Err(UdsError::Transport(_)) => {
                info!("no ECU reset response (ECU likely rebooting)");
            }
            Err(e) => return Err(e),
        }

        {
            let mut state = self.session.write();
            state.enter_session(session_type::DEFAULT);
            state.tester_present_enabled = false;
        }
        let _ = self.tp_enabled.send(false);
        Ok(())
    }

    /// Stop the worker. Pending requests resolve with
    /// [`UdsError::Cancelled`]. Idempotent.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
            info!("UDS client shut down");
        }
    }
}

async fn run_worker(
    mut endpoint: IsoTpEndpoint,
    mut cmd: mpsc::Receiver<Exchange>,
    events: broadcast::Sender<UdsEvent>,
    session: Arc<RwLock<UdsSession>>,
    config: UdsClientConfig,
    tp_toggle: Arc<watch::Sender<bool>>,
) {
    let tp_interval = Duration::from_millis(config.tester_present.interval_ms.max(1));
    let mut tp_enabled = tp_toggle.subscribe();
    let mut last_activity = Instant::now();
    let mut tp_failures: u32 = 0;
    let bus = endpoint.bus().clone();
    let isotp_cfg = endpoint.config().clone();

    loop {
        let tp_at = (*tp_enabled.borrow()).then(|| last_activity + tp_interval);

        tokio::select! {
            exchange = cmd.recv() => {
                let Some(exchange) = exchange else { break };
                let result = execute(&mut endpoint, &exchange).await;
                let _ = events.send(UdsEvent {
                    correlation_id: exchange.correlation_id,
                    service: exchange.service,
                    result: result.clone(),
                });
                if result.is_ok() {
                    last_activity = Instant::now();
                    tp_failures = 0;
                }
                let _ = exchange.reply.send(result);
            }
            changed = tp_enabled.changed() => {
                if changed.is_err() {
                    break;
                }
                last_activity = Instant::now();
            }
            _ = async {
                match tp_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                // Suppressed positive response: a bare SF, no reply expected
                let frame = pdu::single_frame(
                    &isotp_cfg,
                    &[service_id::TESTER_PRESENT, TESTER_PRESENT_SUPPRESS],
                );
                match bus.send(frame).await {
                    Ok(()) => {
                        tp_failures = 0;
                        last_activity = Instant::now();
                    }
                    Err(e) => {
                        tp_failures += 1;
                        warn!(failures = tp_failures, error = %e, "tester present failed");
                        if tp_failures >= TESTER_PRESENT_MAX_FAILURES {
                            warn!("keepalive lost, demoting to default session");
                            let mut state = session.write();
                            state.enter_session(session_type::DEFAULT);
                            state.tester_present_enabled = false;
                            drop(state);
                            tp_failures = 0;
                            let _ = tp_toggle.send(false);
                        }
                        last_activity = Instant::now();
                    }
                }
            }
        }
    }
    debug!("UDS worker ended");
}

/// Run one request/response exchange with P2/P2* timing and NRC 0x78
/// handling.
async fn execute(
    endpoint: &mut IsoTpEndpoint,
    exchange: &Exchange,
) -> Result<UdsResponse, UdsError> {
    debug!(request = %hex::encode(&exchange.request), "sending UDS request");
    endpoint.send_pdu(&exchange.request).await?;

    // P2 runs from the end of transmission; 0x78 restarts it as P2*
    let mut deadline = Instant::now() + exchange.p2;
    loop {
        let pdu = match tokio::time::timeout_at(deadline, endpoint.recv_pdu()).await {
            Err(_) => return Err(UdsError::Timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(pdu)) => pdu,
        };

        let Some(&sid) = pdu.first() else {
            warn!("discarding empty PDU");
            continue;
        };

        if sid == service_id::NEGATIVE_RESPONSE {
            if pdu.len() < 3 {
                return Err(UdsError::ProtocolViolation(
                    "negative response shorter than 3 bytes".to_string(),
                ));
            }
            if pdu[1] != exchange.service {
                // Late negative response to an earlier service
                warn!(
                    service = format!("0x{:02X}", pdu[1]),
                    "stale negative response, still waiting"
                );
                continue;
            }
            let nrc = NegativeResponseCode::from(pdu[2]);
            if nrc == NegativeResponseCode::ResponsePending {
                debug!("response pending, extending to P2*");
                deadline = Instant::now() + exchange.p2_ext;
                continue;
            }
            return Ok(UdsResponse::Negative {
                service: pdu[1],
                nrc,
            });
        }

        if sid == exchange.service.wrapping_add(service_id::POSITIVE_OFFSET) {
            return Ok(UdsResponse::Positive {
                service: sid,
                payload: pdu[1..].to_vec(),
            });
        }

        return Err(UdsError::ProtocolViolation(format!(
            "unexpected response SID 0x{sid:02X} to request 0x{:02X}",
            exchange.service
        )));
    }
}
