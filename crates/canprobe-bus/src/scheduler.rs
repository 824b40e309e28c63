//! Transmit scheduler: single-shot, burst and periodic CAN transmission
//!
//! One worker task drives a min-heap of deadlines (tie-broken by insertion
//! order) with a single timer. Transient send errors are logged and the job
//! keeps its cadence; jobs stop on cancel, on count exhaustion, or when the
//! transport disconnects.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use canprobe_core::CanFrame;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatcher::BusTx;
use crate::transport::LinkState;

/// Handle for cancelling a scheduled job.
pub type JobId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Periodic jobs need a period of at least one millisecond.
    #[error("period must be >= 1 ms")]
    InvalidPeriod,

    #[error("burst count must be nonzero")]
    InvalidCount,

    /// The scheduler task is gone (shutdown or disconnect).
    #[error("scheduler stopped")]
    Stopped,
}

#[derive(Debug)]
enum JobKind {
    Once,
    Burst { remaining: u32, gap: Duration },
    Periodic { period: Duration, remaining: Option<u32> },
}

struct Job {
    frame: CanFrame,
    kind: JobKind,
}

/// Heap entry; ordered by deadline, then by job id (= insertion order).
#[derive(PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    job_id: JobId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

enum Cmd {
    Submit { id: JobId, job: Job },
    Cancel { id: JobId },
}

/// Transmit scheduler front-end. Cheap to clone; all clones feed the same
/// worker.
#[derive(Clone)]
pub struct TxScheduler {
    cmd: mpsc::UnboundedSender<Cmd>,
    next_id: std::sync::Arc<AtomicU64>,
    task: std::sync::Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TxScheduler {
    /// Start the scheduler worker on top of a send handle. The worker
    /// cancels all jobs and exits when the link watch reports a disconnect.
    pub fn spawn(bus: BusTx, link: watch::Receiver<LinkState>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(bus, link, cmd_rx));
        Self {
            cmd: cmd_tx,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
            task: std::sync::Arc::new(Mutex::new(Some(task))),
        }
    }

    fn submit(&self, job: Job) -> Result<JobId, SchedulerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.cmd
            .send(Cmd::Submit { id, job })
            .map_err(|_| SchedulerError::Stopped)?;
        Ok(id)
    }

    /// Transmit `frame` once, as soon as possible.
    pub fn send_once(&self, frame: CanFrame) -> Result<JobId, SchedulerError> {
        self.submit(Job {
            frame,
            kind: JobKind::Once,
        })
    }

    /// Transmit `frame` `count` times with `gap_us` microseconds between
    /// emissions.
    pub fn send_burst(
        &self,
        frame: CanFrame,
        count: u32,
        gap_us: u64,
    ) -> Result<JobId, SchedulerError> {
        if count == 0 {
            return Err(SchedulerError::InvalidCount);
        }
        self.submit(Job {
            frame,
            kind: JobKind::Burst {
                remaining: count,
                gap: Duration::from_micros(gap_us),
            },
        })
    }

    /// Transmit `frame` every `period_ms` milliseconds, `count` times or
    /// until cancelled.
    pub fn send_periodic(
        &self,
        frame: CanFrame,
        period_ms: u64,
        count: Option<u32>,
    ) -> Result<JobId, SchedulerError> {
        if period_ms == 0 {
            return Err(SchedulerError::InvalidPeriod);
        }
        if count == Some(0) {
            return Err(SchedulerError::InvalidCount);
        }
        self.submit(Job {
            frame,
            kind: JobKind::Periodic {
                period: Duration::from_millis(period_ms),
                remaining: count,
            },
        })
    }

    /// Cancel a job. Idempotent; takes effect before the job's next frame.
    pub fn cancel(&self, id: JobId) {
        let _ = self.cmd.send(Cmd::Cancel { id });
    }

    /// Stop the worker and drop all jobs. Idempotent.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("transmit scheduler shut down");
        }
    }
}

async fn run(bus: BusTx, mut link: watch::Receiver<LinkState>, mut cmd: mpsc::UnboundedReceiver<Cmd>) {
    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut jobs: HashMap<JobId, Job> = HashMap::new();

    info!("transmit scheduler started");
    loop {
        // Entries for cancelled jobs linger in the heap; skip them here so
        // a cancel is effective before the next emission.
        while let Some(Reverse(entry)) = heap.peek() {
            if jobs.contains_key(&entry.job_id) {
                break;
            }
            heap.pop();
        }
        let next_deadline = heap.peek().map(|Reverse(e)| e.deadline);

        tokio::select! {
            command = cmd.recv() => match command {
                Some(Cmd::Submit { id, job }) => {
                    debug!(job_id = id, kind = ?job.kind, "job submitted");
                    jobs.insert(id, job);
                    heap.push(Reverse(Entry { deadline: Instant::now(), job_id: id }));
                }
                Some(Cmd::Cancel { id }) => {
                    if jobs.remove(&id).is_some() {
                        debug!(job_id = id, "job cancelled");
                    }
                }
                None => break,
            },
            changed = link.changed() => {
                let down = changed.is_err() || !link.borrow().is_connected();
                if down {
                    if !jobs.is_empty() {
                        warn!(dropped_jobs = jobs.len(), "transport disconnected, stopping all jobs");
                    }
                    break;
                }
            }
            _ = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(Reverse(entry)) = heap.pop() else { continue };
                let Some(job) = jobs.get_mut(&entry.job_id) else { continue };

                if let Err(e) = bus.send(job.frame.clone()).await {
                    if e.is_fatal() {
                        warn!(error = %e, "transport lost, stopping all jobs");
                        break;
                    }
                    // Transient: keep the cadence, drop nothing
                    warn!(job_id = entry.job_id, error = %e, "scheduled send failed");
                }

                let next = match &mut job.kind {
                    JobKind::Once => None,
                    JobKind::Burst { remaining, gap } => {
                        *remaining -= 1;
                        (*remaining > 0).then(|| entry.deadline + *gap)
                    }
                    JobKind::Periodic { period, remaining } => {
                        if let Some(n) = remaining {
                            *n -= 1;
                            if *n == 0 {
                                None
                            } else {
                                Some(entry.deadline + *period)
                            }
                        } else {
                            Some(entry.deadline + *period)
                        }
                    }
                };

                match next {
                    Some(deadline) => heap.push(Reverse(Entry { deadline, job_id: entry.job_id })),
                    None => {
                        jobs.remove(&entry.job_id);
                        debug!(job_id = entry.job_id, "job complete");
                    }
                }
            }
        }
    }
    info!("transmit scheduler stopped");
}
