//! Stdout tokenizer.
//!
//! Splits a live terminal stream into one event per line. Counters start at 1
//! and line offsets start at 0, so the n-th line is `{counter: n, start_line:
//! n - 1, end_line: n}`. A trailing partial line is held until more bytes
//! arrive or the capture is closed.

use crate::event::Event;
use crate::payload::QueuePayload;
use crate::queue::EventSink;
use bastion_core::JobId;
use std::sync::Arc;

/// Turns raw process output into ordered events
pub struct OutputCapture {
    job_id: JobId,
    uuid: Option<String>,
    sink: Arc<dyn EventSink>,
    pending: Vec<u8>,
    counter: u64,
    next_line: u64,
    closed: bool,
}

impl OutputCapture {
    /// Create a capture for one job
    #[must_use]
    pub fn new(job_id: JobId, uuid: Option<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            job_id,
            uuid,
            sink,
            pending: Vec::new(),
            counter: 0,
            next_line: 0,
            closed: false,
        }
    }

    /// Feed a chunk of raw output
    ///
    /// Returns the number of complete lines emitted.
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        if self.closed {
            return 0;
        }
        self.pending.extend_from_slice(chunk);
        let mut emitted = 0;
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit_line(&line[..line.len() - 1]);
            emitted += 1;
        }
        emitted
    }

    /// Bytes of the current unterminated line
    #[must_use]
    pub fn partial_line(&self) -> &[u8] {
        &self.pending
    }

    /// Last counter assigned
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Flush the partial line and emit the end-of-stream sentinel
    ///
    /// Returns the number of events emitted. Closing twice is a no-op.
    pub fn close(&mut self) -> u64 {
        if self.closed {
            return self.counter;
        }
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit_line(&rest);
        }
        self.closed = true;
        self.sink
            .emit(QueuePayload::eof(self.job_id, self.counter, self.uuid.clone()));
        tracing::debug!(job_id = %self.job_id, events = self.counter, "capture closed");
        self.counter
    }

    fn emit_line(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw).into_owned();
        self.counter += 1;
        let start = self.next_line;
        self.next_line += 1;

        let mut event = Event::new(self.job_id, self.counter, start, text).with_lines(start, start + 1);
        event.uuid = self.uuid.clone();
        let mut payload = QueuePayload::from_event(&event);
        payload.stamp_job(self.job_id);
        self.sink.emit(payload);
    }
}

impl std::fmt::Debug for OutputCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCapture")
            .field("job_id", &self.job_id)
            .field("counter", &self.counter)
            .field("next_line", &self.next_line)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::validate_contiguous;
    use crate::payload::PayloadKind;
    use crate::queue::MemoryQueue;
    use proptest::prelude::*;

    fn events(queue: &MemoryQueue) -> Vec<Event> {
        queue
            .payloads()
            .into_iter()
            .filter_map(|p| match p.classify() {
                Ok(PayloadKind::JobEvent(e)) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_capture_splits_lines() {
        let queue = Arc::new(MemoryQueue::new());
        let mut capture = OutputCapture::new(JobId::new(7), Some("u".into()), queue.clone());
        assert_eq!(capture.feed(b"one\r\ntw"), 1);
        assert_eq!(capture.partial_line(), b"tw");
        assert_eq!(capture.feed(b"o\nthree"), 1);
        assert_eq!(capture.close(), 3);

        let evs = events(&queue);
        let text: Vec<_> = evs.iter().map(|e| e.stdout.as_str()).collect();
        assert_eq!(text, vec!["one", "two", "three"]);
        assert_eq!(evs[0].counter, 1);
        assert_eq!((evs[2].start_line, evs[2].end_line), (2, 3));
        assert!(evs.iter().all(|e| e.uuid.as_deref() == Some("u")));
    }

    #[test]
    fn test_close_emits_eof_once() {
        let queue = Arc::new(MemoryQueue::new());
        let mut capture = OutputCapture::new(JobId::new(1), None, queue.clone());
        capture.feed(b"a\n");
        capture.close();
        capture.close();
        capture.feed(b"late\n");
        let payloads = queue.payloads();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[1].is_eof());
        assert_eq!(payloads[1].counter, Some(1));
    }

    #[test]
    fn test_empty_stream() {
        let queue = Arc::new(MemoryQueue::new());
        let mut capture = OutputCapture::new(JobId::new(1), None, queue.clone());
        assert_eq!(capture.close(), 0);
        assert_eq!(queue.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_events_are_line_contiguous(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..32)) {
            let queue = Arc::new(MemoryQueue::new());
            let mut capture = OutputCapture::new(JobId::new(1), None, queue.clone());
            for chunk in &chunks {
                capture.feed(chunk);
            }
            let total = capture.close();
            let evs = events(&queue);
            prop_assert_eq!(evs.len() as u64, total);
            prop_assert!(validate_contiguous(&evs).is_ok());
            for (i, e) in evs.iter().enumerate() {
                prop_assert_eq!(e.counter, i as u64 + 1);
            }
        }
    }
}
