//! Check and preparation jobs.
//!
//! Repository checks run on the server against the repository and
//! initialize it when it does not exist yet. Client and hypervisor
//! preparation bootstrap onto the host and verify the tooling.

use crate::builder::{repository_key, CommandBuilder};
use crate::command::CommandLine;
use crate::context::BuildContext;
use crate::env;
use crate::error::BuildError;
use crate::remote::RemoteBootstrap;
use crate::shell;
use bastion_core::{JobType, PrepareTarget, Secret};

/// Builds `check` jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckBuilder;

impl CheckBuilder {
    fn repository_command(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
        let repository = ctx.require_repository()?;
        let borg = shell::quote(&ctx.settings.borg);
        let script = if ctx.job.prepare == Some(PrepareTarget::Repository) {
            format!(
                "{borg} info \"$BORG_REPO\" >/dev/null 2>&1 || {borg} init --encryption=repokey-blake2 \"$BORG_REPO\"\n{borg} info \"$BORG_REPO\"",
            )
        } else {
            format!("{borg} check --verbose --show-rc \"$BORG_REPO\"")
        };
        let mut cmd = CommandLine::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script,
            "bastion-check".to_string(),
        ]);
        cmd.env = env::repository_env(ctx, true)?;
        cmd.env.extend(env::agent_env(ctx));
        tracing::debug!(job_id = %ctx.job.id, repository = %repository.id, "built repository check");
        Ok(cmd)
    }

    fn host_command(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
        let host = ctx.require_client()?;
        let borg = shell::quote(&ctx.settings.borg);
        let mut bootstrap = RemoteBootstrap::new(*ctx, host)
            .line(format!(
                "command -v {borg} >/dev/null 2>&1 || {{ echo \"borg is not installed on $(hostname)\"; exit 3; }}"
            ))
            .line(format!("{borg} --version"));
        if ctx.job.prepare == Some(PrepareTarget::Hypervisor) {
            bootstrap = bootstrap
                .line("command -v virsh >/dev/null 2>&1 || { echo \"virsh is not installed on $(hostname)\"; exit 3; }")
                .line("virsh list --all --name >/dev/null");
        }
        bootstrap.build()
    }
}

impl CommandBuilder for CheckBuilder {
    fn job_type(&self) -> JobType {
        JobType::Check
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
        match ctx.job.prepare {
            Some(PrepareTarget::Client | PrepareTarget::Hypervisor) => self.host_command(ctx),
            Some(PrepareTarget::Repository) | None => self.repository_command(ctx),
        }
    }

    fn ssh_key<'a>(&self, ctx: &BuildContext<'a>) -> Option<(&'a Secret, Option<&'a Secret>)> {
        match ctx.job.prepare {
            Some(PrepareTarget::Client | PrepareTarget::Hypervisor) => {
                let host = ctx.client?;
                let key = host.credentials.ssh_private_key.as_ref()?;
                Some((key, host.credentials.ssh_key_passphrase.as_ref()))
            }
            _ => repository_key(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::World;
    use crate::remote::SCRIPT_FILE;

    #[test]
    fn test_repository_prepare_inits_when_missing() {
        let mut world = World::new(JobType::Check);
        world.job.prepare = Some(PrepareTarget::Repository);
        world.job.client_id = None;
        let cmd = CheckBuilder.build(&world.ctx()).unwrap();
        assert!(cmd.argv[2].contains("init --encryption=repokey-blake2"));
        assert_eq!(cmd.env["BORG_PASSPHRASE"], "correct horse");
        assert!(cmd.files.is_empty());
    }

    #[test]
    fn test_manual_check_runs_borg_check() {
        let world = World::new(JobType::Check);
        let cmd = CheckBuilder.build(&world.ctx()).unwrap();
        assert!(cmd.argv[2].starts_with("borg check"));
    }

    #[test]
    fn test_hypervisor_prepare_checks_virsh() {
        let mut world = World::new(JobType::Check);
        world.job.prepare = Some(PrepareTarget::Hypervisor);
        world.client = world.hypervisor.clone();
        let cmd = CheckBuilder.build(&world.ctx()).unwrap();
        let script = cmd.files.iter().find(|f| f.name == SCRIPT_FILE).unwrap();
        assert!(script.contents.expose().contains("virsh"));
        assert!(cmd.argv[2].contains("root@kvm1"));
    }

    #[test]
    fn test_client_prepare_stages_client_key() {
        let mut world = World::new(JobType::Check);
        world.job.prepare = Some(PrepareTarget::Client);
        let ctx = world.ctx();
        let (key, passphrase) = CheckBuilder.ssh_key(&ctx).unwrap();
        assert_eq!(key.expose(), "-----BEGIN KEY-----");
        assert!(passphrase.is_none());
    }
}
