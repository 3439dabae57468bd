use std::collections::VecDeque;
use std::sync::Mutex;

use netcon_stack::packet::EthernetFrame;

/// Per-entry bookkeeping charged on top of the frame bytes (the length prefix).
const ENTRY_OVERHEAD: usize = 4;

#[derive(Debug, Default)]
struct Inner {
    frames: VecDeque<Vec<u8>>,
    bytes: usize,
}

/// Inbound Ethernet frames waiting for the pump, oldest first.
#[derive(Debug)]
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues one complete frame (header included). Returns false, leaving the queue untouched,
    /// when it would not fit.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        debug_assert!(frame.len() >= EthernetFrame::HEADER_LEN);
        let cost = ENTRY_OVERHEAD + frame.len();
        let mut inner = self.lock();
        if inner.bytes + cost > self.capacity {
            return false;
        }
        inner.bytes += cost;
        inner.frames.push_back(frame);
        true
    }

    /// Removes every queued frame.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut inner = self.lock();
        inner.bytes = 0;
        inner.frames.drain(..).collect()
    }

    pub fn queued_bytes(&self) -> usize {
        self.lock().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }
}
