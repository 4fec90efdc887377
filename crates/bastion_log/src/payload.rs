//! Queue payloads.
//!
//! Wire shape: `{job_id?, catalog?, event?, uuid?, counter?, stdout?,
//! start_line?, end_line?, created?}`. The sentinel `{"event": "EOF", ...}`
//! ends a job's stream.

use crate::catalog::{self, CatalogEntry, CatalogError};
use crate::event::Event;
use bastion_core::{JobId, Timestamp};
use serde::{Deserialize, Serialize};

/// Event name of the end-of-stream sentinel
pub const EOF_EVENT: &str = "EOF";

/// Payload errors
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Not valid JSON for the payload shape
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Neither a job event nor a catalog entry
    #[error("payload carries no job_id or catalog key")]
    Unclassified,

    /// Job event without a required field
    #[error("job event missing field `{0}`")]
    MissingField(&'static str),

    /// Catalog blob could not be decoded
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Raw queue payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePayload {
    /// Owning job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// base64(gzip(json)) catalog entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    /// Event name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Routing uuid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Producer counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    /// Captured text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// First line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u64>,
    /// Line after the last
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u64>,
    /// Capture time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<Timestamp>,
}

/// Classified payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    /// Output event to persist
    JobEvent(Event),
    /// Catalog entries to persist
    Catalog {
        /// Job that produced the catalog
        job_id: JobId,
        /// Decoded entries
        entries: Vec<CatalogEntry>,
    },
    /// End of a job's stream
    Eof {
        /// Finished job
        job_id: JobId,
        /// Last counter emitted
        final_counter: u64,
    },
}

impl QueuePayload {
    /// Payload for a captured event
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self {
            job_id: Some(event.job_id),
            catalog: None,
            event: Some(event.event.clone()),
            uuid: event.uuid.clone(),
            counter: Some(event.counter),
            stdout: Some(event.stdout.clone()),
            start_line: Some(event.start_line),
            end_line: Some(event.end_line),
            created: Some(event.created),
        }
    }

    /// End-of-stream sentinel
    #[must_use]
    pub fn eof(job_id: JobId, final_counter: u64, uuid: Option<String>) -> Self {
        Self {
            job_id: Some(job_id),
            event: Some(EOF_EVENT.to_string()),
            uuid,
            counter: Some(final_counter),
            created: Some(Timestamp::now()),
            ..Self::default()
        }
    }

    /// Catalog payload
    #[must_use]
    pub fn catalog(job_id: JobId, encoded: String) -> Self {
        Self {
            job_id: Some(job_id),
            catalog: Some(encoded),
            ..Self::default()
        }
    }

    /// Fill in the job id if the producer left it out
    pub fn stamp_job(&mut self, job_id: JobId) {
        if self.job_id.is_none() {
            self.job_id = Some(job_id);
        }
    }

    /// Whether this is the end-of-stream sentinel
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.event.as_deref() == Some(EOF_EVENT)
    }

    /// Parse from JSON text
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for invalid JSON
    pub fn from_json(text: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Classify by which well-known key is present
    ///
    /// # Errors
    ///
    /// Returns error if the payload is neither a job event nor a catalog
    /// entry, or a required field is missing.
    pub fn classify(&self) -> Result<PayloadKind, PayloadError> {
        if let Some(blob) = &self.catalog {
            let job_id = self.job_id.ok_or(PayloadError::MissingField("job_id"))?;
            let entries = catalog::decode(blob)?;
            return Ok(PayloadKind::Catalog { job_id, entries });
        }

        let job_id = self.job_id.ok_or(PayloadError::Unclassified)?;

        if self.is_eof() {
            return Ok(PayloadKind::Eof {
                job_id,
                final_counter: self.counter.unwrap_or(0),
            });
        }

        let counter = self.counter.ok_or(PayloadError::MissingField("counter"))?;
        let stdout = self.stdout.clone().unwrap_or_default();
        let start_line = self.start_line.unwrap_or(0);
        let end_line = self.end_line.unwrap_or(start_line);

        let mut event = Event::new(job_id, counter, start_line, stdout).with_lines(start_line, end_line);
        event.uuid = self.uuid.clone();
        if let Some(name) = &self.event {
            event.event = name.clone();
        }
        if let Some(created) = self.created {
            event.created = created;
        }
        Ok(PayloadKind::JobEvent(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_job_event() {
        let payload = QueuePayload::from_json(
            r#"{"job_id": 4, "counter": 2, "stdout": "x", "start_line": 1, "end_line": 2, "uuid": "u"}"#,
        )
        .unwrap();
        match payload.classify().unwrap() {
            PayloadKind::JobEvent(event) => {
                assert_eq!(event.job_id, JobId::new(4));
                assert_eq!(event.counter, 2);
                assert_eq!((event.start_line, event.end_line), (1, 2));
                assert_eq!(event.uuid.as_deref(), Some("u"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_eof() {
        let payload = QueuePayload::eof(JobId::new(3), 17, None);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"event\":\"EOF\""));
        let back = QueuePayload::from_json(&json).unwrap();
        assert_eq!(
            back.classify().unwrap(),
            PayloadKind::Eof { job_id: JobId::new(3), final_counter: 17 }
        );
    }

    #[test]
    fn test_classify_unclassified() {
        let payload = QueuePayload::from_json(r#"{"stdout": "orphan"}"#).unwrap();
        assert!(matches!(payload.classify(), Err(PayloadError::Unclassified)));
    }

    #[test]
    fn test_classify_missing_counter() {
        let payload = QueuePayload::from_json(r#"{"job_id": 1, "stdout": "x"}"#).unwrap();
        assert!(matches!(payload.classify(), Err(PayloadError::MissingField("counter"))));
    }

    #[test]
    fn test_stamp_job_only_when_absent() {
        let mut payload = QueuePayload::default();
        payload.stamp_job(JobId::new(1));
        payload.stamp_job(JobId::new(2));
        assert_eq!(payload.job_id, Some(JobId::new(1)));
    }

    #[test]
    fn test_from_event_round_trip_fields() {
        let event = Event::new(JobId::new(8), 5, 10, "line".to_string()).with_uuid("r");
        let payload = QueuePayload::from_event(&event);
        assert_eq!(payload.classify().unwrap(), PayloadKind::JobEvent(event));
    }
}
