//! BASTION Event Log
//!
//! Output events of running jobs: the record itself, the JSON payloads
//! exchanged over the durable queue, and the stdout tokenizer that turns a
//! live terminal stream into ordered, line-contiguous events.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod catalog;
pub mod chain;
pub mod event;
pub mod payload;
pub mod queue;

pub use capture::OutputCapture;
pub use catalog::{CatalogEntry, CatalogError};
pub use chain::{ChainError, LineChain};
pub use event::Event;
pub use payload::{PayloadError, PayloadKind, QueuePayload, EOF_EVENT};
pub use queue::{EventSink, MemoryQueue};
