//! Payload routing.
//!
//! Enqueueing never blocks: a full preferred queue sends the payload to the
//! next worker in fixed rotation, and a payload that fits nowhere is dropped.

use crate::stats::PipelineStats;
use bastion_log::QueuePayload;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Where a payload went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Enqueued on worker `n`
    Worker(usize),
    /// Every queue was full or closed
    Dropped,
}

/// Shards payloads over the worker queues
#[derive(Debug)]
pub struct Router {
    queues: Vec<mpsc::Sender<QueuePayload>>,
    next: u64,
    stats: Arc<PipelineStats>,
}

/// Stable shard of a uuid
fn shard(uuid: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    uuid.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

impl Router {
    /// Route into `queues`
    #[must_use]
    pub fn new(queues: Vec<mpsc::Sender<QueuePayload>>, stats: Arc<PipelineStats>) -> Self {
        Self {
            queues,
            next: 0,
            stats,
        }
    }

    /// Worker count
    #[must_use]
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Preferred worker for `payload`
    #[must_use]
    pub fn preferred(&mut self, payload: &QueuePayload) -> usize {
        let workers = self.queues.len().max(1);
        match payload.uuid.as_deref() {
            Some(uuid) => shard(uuid, workers),
            None => {
                let index = (self.next % workers as u64) as usize;
                self.next = self.next.wrapping_add(1);
                index
            }
        }
    }

    /// Enqueue `payload` without waiting
    pub fn route(&mut self, payload: QueuePayload) -> Route {
        if self.queues.is_empty() {
            self.stats.record_dropped_full();
            return Route::Dropped;
        }
        let first = self.preferred(&payload);
        let workers = self.queues.len();
        let mut payload = payload;
        for offset in 0..workers {
            let index = (first + offset) % workers;
            match self.queues[index].try_send(payload) {
                Ok(()) => {
                    if offset > 0 {
                        tracing::debug!(preferred = first, worker = index, "worker queue full, rerouted");
                    }
                    self.stats.record_routed();
                    return Route::Worker(index);
                }
                Err(TrySendError::Full(back) | TrySendError::Closed(back)) => payload = back,
            }
        }
        tracing::warn!(
            job_id = ?payload.job_id,
            counter = ?payload.counter,
            "all worker queues full, payload dropped"
        );
        self.stats.record_dropped_full();
        Route::Dropped
    }
}
