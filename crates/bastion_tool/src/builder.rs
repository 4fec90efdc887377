//! Builder contract.

use crate::command::CommandLine;
use crate::context::BuildContext;
use crate::error::BuildError;
use bastion_core::{JobType, Secret};

/// Maps a job and its configuration to a command line
///
/// Implementations must be pure: the same context yields the same command.
pub trait CommandBuilder: Send + Sync {
    /// Job type handled
    fn job_type(&self) -> JobType;

    /// Build the command
    ///
    /// # Errors
    ///
    /// Returns error if configuration or launch options are missing
    fn build(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError>;

    /// SSH key to stage for this job, with its passphrase
    ///
    /// Defaults to the key of the host the remote shell runs on.
    fn ssh_key<'a>(&self, ctx: &BuildContext<'a>) -> Option<(&'a Secret, Option<&'a Secret>)> {
        let host = ctx.remote_host().ok()?;
        let key = host.credentials.ssh_private_key.as_ref()?;
        Some((key, host.credentials.ssh_key_passphrase.as_ref()))
    }

    /// Whether the command needs a reverse tunnel port
    fn needs_tunnel(&self, _ctx: &BuildContext<'_>) -> bool {
        false
    }
}

/// Key of the repository host, for builders acting on the repository
#[must_use]
pub fn repository_key<'a>(ctx: &BuildContext<'a>) -> Option<(&'a Secret, Option<&'a Secret>)> {
    let repository = ctx.repository?;
    let key = repository.credentials.ssh_private_key.as_ref()?;
    Some((key, repository.credentials.ssh_key_passphrase.as_ref()))
}
