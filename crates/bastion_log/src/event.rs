//! Job output events.
//!
//! `counter` is assigned by the producer and is the authoritative order;
//! persistence order may differ under concurrent workers.

use bastion_core::{JobId, Timestamp};
use serde::{Deserialize, Serialize};

/// One ordered slice of a job's captured output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Owning job
    pub job_id: JobId,
    /// Producer-assigned, strictly increasing per job
    pub counter: u64,
    /// First line covered (inclusive)
    pub start_line: u64,
    /// Line after the last one covered (exclusive)
    pub end_line: u64,
    /// Captured text
    pub stdout: String,
    /// Correlation id used for routing
    pub uuid: Option<String>,
    /// Event name
    pub event: String,
    /// Capture time
    pub created: Timestamp,
}

impl Event {
    /// Event name used for plain output lines
    pub const VERBOSE: &'static str = "verbose";

    /// Create an output event
    #[must_use]
    pub fn new(job_id: JobId, counter: u64, start_line: u64, stdout: String) -> Self {
        let lines = stdout.lines().count().max(1) as u64;
        Self {
            job_id,
            counter,
            start_line,
            end_line: start_line + lines,
            stdout,
            uuid: None,
            event: Self::VERBOSE.to_string(),
            created: Timestamp::now(),
        }
    }

    /// Set the routing uuid
    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Set the line range explicitly
    #[must_use]
    pub fn with_lines(mut self, start_line: u64, end_line: u64) -> Self {
        self.start_line = start_line;
        self.end_line = end_line;
        self
    }

    /// Number of lines covered
    #[must_use]
    pub fn line_count(&self) -> u64 {
        self.end_line.saturating_sub(self.start_line)
    }
}
