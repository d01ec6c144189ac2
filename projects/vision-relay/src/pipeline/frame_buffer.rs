// Single-slot, drop-oldest frame buffer between a session's reader and processor.
//
// `put` never blocks: an unread frame is overwritten by the newer one, which
// bounds end-to-end latency to one frame period regardless of consumer speed.

use crate::error::ClosedBufferError;
use crate::pipeline::types::Frame;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    closed: bool,
}

/// Outcome of a successful `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The previous unread frame was discarded.
    Replaced,
}

#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
    notify: Notify,
    dropped: AtomicUsize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the lock cannot leave the slot half-written.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a frame, replacing any unread one.
    pub fn put(&self, frame: Frame) -> Result<PutOutcome, ClosedBufferError> {
        let outcome = {
            let mut slot = self.lock();
            if slot.closed {
                return Err(ClosedBufferError);
            }
            match slot.frame.replace(frame) {
                Some(_) => PutOutcome::Replaced,
                None => PutOutcome::Stored,
            }
        };
        if outcome == PutOutcome::Replaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Wait for the next frame. Returns `ClosedBufferError` once the buffer is closed.
    pub async fn take(&self) -> Result<Frame, ClosedBufferError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut slot = self.lock();
                if slot.closed {
                    return Err(ClosedBufferError);
                }
                if let Some(frame) = slot.frame.take() {
                    return Ok(frame);
                }
            }
            notified.await;
        }
    }

    /// Close the buffer, discarding any unread frame and waking the consumer.
    /// Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let was_open = {
            let mut slot = self.lock();
            let was_open = !slot.closed;
            slot.closed = true;
            slot.frame = None;
            was_open
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        was_open
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().frame.is_none()
    }

    /// Number of frames overwritten before they were consumed
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
