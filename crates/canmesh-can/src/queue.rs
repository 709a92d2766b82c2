//! Bounded TX deque with front insertion.
//!
//! Mirrors the behavior of the firmware transmit queue: normal sends append,
//! high-priority sends and retry re-entries prepend, producers block while
//! the queue is full. Retry re-entry uses [`TxQueue::requeue_front`], which
//! may exceed capacity by the one frame being retried so the worker can
//! never deadlock against a full queue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{CanError, CanResult};
use crate::frame::CanFrame;
use crate::metrics::QueueStatus;

/// Bounded deque of frames awaiting transmission.
#[derive(Debug)]
pub struct TxQueue {
    frames: Mutex<VecDeque<CanFrame>>,
    capacity: usize,
    items: Notify,
    space: Notify,
}

impl TxQueue {
    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Enqueue a frame, waiting for space when full.
    ///
    /// `high_priority` prepends so the frame is transmitted next.
    pub async fn push(&self, frame: CanFrame, high_priority: bool) -> CanResult<()> {
        loop {
            {
                let mut frames = self.frames.lock();
                if frames.len() < self.capacity {
                    if high_priority {
                        frames.push_front(frame);
                    } else {
                        frames.push_back(frame);
                    }
                    drop(frames);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            self.space.notified().await;
        }
    }

    /// Prepend a frame being retried, ignoring the capacity bound.
    pub fn requeue_front(&self, frame: CanFrame) {
        self.frames.lock().push_front(frame);
        self.items.notify_one();
    }

    /// Take the next frame, waiting until one is available.
    pub async fn pop(&self) -> CanFrame {
        loop {
            {
                let mut frames = self.frames.lock();
                if let Some(frame) = frames.pop_front() {
                    drop(frames);
                    self.space.notify_one();
                    return frame;
                }
            }
            self.items.notified().await;
        }
    }

    /// Take the next frame without waiting.
    pub fn try_pop(&self) -> Option<CanFrame> {
        let frame = self.frames.lock().pop_front();
        if frame.is_some() {
            self.space.notify_one();
        }
        frame
    }

    /// Number of frames currently waiting.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Occupancy snapshot.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            messages_waiting: self.len(),
            queue_capacity: self.capacity,
        }
    }

    /// Enqueue without waiting; error when full. Used by sync callers that
    /// must not suspend.
    pub fn try_push(&self, frame: CanFrame, high_priority: bool) -> CanResult<()> {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return Err(CanError::unknown("transmit queue full"));
        }
        if high_priority {
            frames.push_front(frame);
        } else {
            frames.push_back(frame);
        }
        drop(frames);
        self.items.notify_one();
        Ok(())
    }
}
