//! BASTION Storage
//!
//! The data access the core needs from the surrounding application: job
//! records (read/write, field-scoped), output events and catalog entries
//! (write), and read-only configuration. Two backends are provided, an
//! in-memory store for tests and a redb file for single-host deployments.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod lock;
pub mod memory;
pub mod redb_store;
pub mod retry;
pub mod store;

pub use config::{MemoryConfig, ReadyTarget};
pub use error::{StoreError, StoreResult};
pub use lock::{AdvisoryLock, FileLock, LocalLock, LockGuard};
pub use memory::{MemoryStore, StoreFault};
pub use redb_store::RedbStore;
pub use retry::{update_with_retry, with_retry, RetryPolicy};
pub use store::{ConfigSource, EventStore, JobStore};
