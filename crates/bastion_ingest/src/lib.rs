//! BASTION Event Ingestion
//!
//! Persists the output-event stream of running jobs. A single router reads
//! the durable queue and shards payloads over a fixed pool of workers, each
//! with one bounded queue:
//! - payloads with a correlation uuid go to `hash(uuid) mod N`, so a job's
//!   burst stays on one worker and keeps its relative order
//! - payloads without one are spread round-robin
//!
//! Workers persist with linear backoff on transient storage errors and
//! escalate to a process-terminating signal when storage stays down. The
//! producer-assigned `counter` stays the authoritative event order; the
//! persistence order across workers is not.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod escalation;
pub mod pipeline;
pub mod router;
pub mod settings;
pub mod shutdown;
pub mod source;
pub mod stats;
pub mod worker;

pub use error::{IngestError, IngestResult};
pub use escalation::{Escalation, RecordingEscalation, SignalEscalation};
pub use pipeline::{IngestContext, Pipeline};
pub use router::{Route, Router};
pub use settings::IngestSettings;
pub use shutdown::{reraise, ShutdownSignals};
pub use source::{channel, sink_channel, ChannelSink, ChannelSource, JsonLinesSource, PayloadSource};
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker::Worker;
