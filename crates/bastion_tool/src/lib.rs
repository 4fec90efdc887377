//! BASTION Command Builders
//!
//! One builder per job type maps a job and its configuration to a concrete
//! command line. Builders are pure: they never touch the filesystem or the
//! network. Files the command needs (environment file, remote script) are
//! returned alongside the argv and written by the executor.
//!
//! Prune and restore act on the repository from the server. Backup, catalog
//! and host preparation bootstrap a remote shell: the environment file and a
//! small script are copied with `scp`, then run over `ssh`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod builder;
pub mod builders;
pub mod command;
pub mod context;
pub mod env;
pub mod error;
pub mod registry;
pub mod remote;
pub mod shell;
pub mod tunnel;

pub use agent::wrap_with_agent;
pub use builder::CommandBuilder;
pub use command::{CommandLine, Prompt, ScratchFile};
pub use context::{BuildContext, ToolSettings};
pub use error::BuildError;
pub use registry::BuilderRegistry;
pub use tunnel::{TunnelLease, TunnelPorts};
