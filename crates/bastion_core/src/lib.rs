//! BASTION Core Types
//!
//! Pure types and logic shared by the scheduler, executor and event pipeline.
//! This crate performs no I/O: the job lifecycle lattice, configuration
//! records and notification payloads all live here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod notify;
pub mod secret;
pub mod time;

// Re-exports
pub use config::{BackupMode, Client, Credentials, Policy, PolicyType, Repository, Retention};
pub use error::{CoreError, CoreResult};
pub use id::{ClientId, CorrelationId, JobId, PolicyId, RepositoryId};
pub use job::{Job, JobOptions, JobStatus, JobType, JobUpdate, LaunchType, PrepareTarget};
pub use notify::{MemoryNotifier, Notification, Notifier, TracingNotifier};
pub use secret::Secret;
pub use time::Timestamp;
