//! Bounded frame history shared between the dispatcher and UI-side readers

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::frame::CanFrame;

/// Default ring capacity (frames).
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded FIFO of captured frames with oldest-first eviction.
///
/// Exactly one writer (the dispatcher) pushes; readers take snapshots. Live
/// observation goes through the dispatcher's broadcast channel instead — the
/// ring exists so a late-attaching reader (log view, export) can see recent
/// history without having subscribed from the start.
///
/// Entries are in non-decreasing timestamp order because the single writer
/// stamps frames from one monotonic clock before pushing.
pub struct FrameRing {
    capacity: usize,
    inner: Mutex<VecDeque<CanFrame>>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append a frame, evicting the oldest entry once full.
    pub fn push(&self, frame: CanFrame) {
        let mut buf = self.inner.lock();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(frame);
    }

    /// Number of frames currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Fixed capacity of the ring.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<CanFrame> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Drop all held frames (e.g. on reconnect).
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
