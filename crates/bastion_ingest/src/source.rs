//! Payload sources.
//!
//! The scheduler daemon feeds the router from an in-process channel: the
//! executors emit into a [`ChannelSink`] and the pipeline drains the paired
//! source. JSON lines on a reader such as stdin feed a standalone pipeline.

use async_trait::async_trait;
use bastion_log::{EventSink, QueuePayload};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

/// Consumer side of the durable queue
#[async_trait]
pub trait PayloadSource: Send {
    /// Next payload, or `None` once the source is exhausted
    async fn next_payload(&mut self) -> Option<QueuePayload>;
}

/// Source fed through a tokio channel
#[derive(Debug)]
pub struct ChannelSource {
    rx: Receiver,
}

#[derive(Debug)]
enum Receiver {
    Bounded(mpsc::Receiver<QueuePayload>),
    Unbounded(mpsc::UnboundedReceiver<QueuePayload>),
}

/// Create a bounded channel and its source
#[must_use]
pub fn channel(capacity: usize) -> (mpsc::Sender<QueuePayload>, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        ChannelSource {
            rx: Receiver::Bounded(rx),
        },
    )
}

/// Create an event sink and the source it feeds
///
/// The channel is unbounded so `emit` never blocks a running job; the
/// pipeline's worker queues apply the backpressure.
#[must_use]
pub fn sink_channel() -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelSink {
            tx: Mutex::new(Some(tx)),
        },
        ChannelSource {
            rx: Receiver::Unbounded(rx),
        },
    )
}

#[async_trait]
impl PayloadSource for ChannelSource {
    async fn next_payload(&mut self) -> Option<QueuePayload> {
        match &mut self.rx {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Event sink feeding a pipeline in the same process
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<QueuePayload>>>,
}

impl ChannelSink {
    /// Stop accepting payloads
    ///
    /// The paired source ends once it has yielded everything sent before.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, payload: QueuePayload) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            tracing::warn!(job_id = ?payload.job_id, counter = ?payload.counter, "event pipeline closed, payload dropped");
            return;
        };
        if let Err(err) = tx.send(payload) {
            let payload = err.0;
            tracing::warn!(job_id = ?payload.job_id, counter = ?payload.counter, "event pipeline stopped, payload dropped");
        }
    }
}

/// Source reading one JSON payload per line
///
/// Blank lines are ignored; malformed lines are logged and skipped.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: u64,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    /// Read payloads from `reader`
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Lines that could not be parsed
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> PayloadSource for JsonLinesSource<R> {
    async fn next_payload(&mut self) -> Option<QueuePayload> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => {
                    tracing::error!(error = %err, line = self.line_no, "payload source failed");
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match QueuePayload::from_json(&line) {
                Ok(payload) => return Some(payload),
                Err(err) => {
                    self.skipped += 1;
                    tracing::warn!(line = self.line_no, error = %err, "skipping malformed payload");
                }
            }
        }
    }
}
