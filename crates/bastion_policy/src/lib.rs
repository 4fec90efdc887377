//! BASTION Policy Expansion
//!
//! Turns a backup policy into per-client job chains and keeps secrets out of
//! every command line, environment and log line that gets persisted.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod expand;
pub mod redact;

pub use expand::{expand_policy, ExpandError, JobChain};
pub use redact::{Redactor, REDACTED};
