//! Producer side of the event queue.
//!
//! The scheduler daemon feeds its in-process pipeline through a channel sink
//! defined next to the pipeline. [`MemoryQueue`] keeps payloads in memory.

use crate::payload::QueuePayload;
use std::sync::Mutex;

/// Destination for payloads produced by a running job
///
/// `emit` must not block on a slow consumer.
pub trait EventSink: Send + Sync {
    /// Publish one payload
    fn emit(&self, payload: QueuePayload);
}

/// Sink that keeps payloads in memory
#[derive(Debug, Default)]
pub struct MemoryQueue {
    payloads: Mutex<Vec<QueuePayload>>,
}

impl MemoryQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads emitted so far
    #[must_use]
    pub fn payloads(&self) -> Vec<QueuePayload> {
        self.payloads.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Remove and return everything emitted so far
    pub fn drain(&self) -> Vec<QueuePayload> {
        self.payloads
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }

    /// Number of payloads held
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Check if nothing was emitted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryQueue {
    fn emit(&self, payload: QueuePayload) {
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(payload);
        }
    }
}
