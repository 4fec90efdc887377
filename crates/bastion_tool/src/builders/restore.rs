//! Restore jobs.
//!
//! The archive is streamed out of the repository on the server as a tar and
//! unpacked on the client over ssh.

use crate::builder::{repository_key, CommandBuilder};
use crate::command::CommandLine;
use crate::context::BuildContext;
use crate::env;
use crate::error::BuildError;
use crate::remote::SUDO_PROMPT;
use crate::shell;
use bastion_core::{JobOptions, JobType, Secret};

/// Builds `restore` jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreBuilder;

impl CommandBuilder for RestoreBuilder {
    fn job_type(&self) -> JobType {
        JobType::Restore
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
        let client = ctx.require_client()?;
        ctx.require_repository()?;
        let options = &ctx.job.options;
        let archive = options
            .archive
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| BuildError::InvalidOptions {
                job: ctx.job.id,
                reason: "restore needs an archive".to_string(),
            })?;
        if archive == JobOptions::LATEST_ARCHIVE {
            return Err(BuildError::InvalidOptions {
                job: ctx.job.id,
                reason: "archive \"latest\" was not resolved before start".to_string(),
            });
        }
        let destination = options.destination.as_deref().unwrap_or("/");

        let mut export = vec![
            ctx.settings.borg.clone(),
            "export-tar".to_string(),
            format!("::{}", archive),
            "-".to_string(),
        ];
        export.extend(options.paths.iter().cloned());

        let unpack = format!(
            "mkdir -p {dest} && tar -xpf - -C {dest}",
            dest = shell::quote(destination)
        );
        let become_password = client.credentials.become_password.as_ref();
        let unpack = if client.username != "root" && become_password.is_some() {
            format!("sudo -S -p '[sudo] password: ' sh -c {}", shell::quote(&unpack))
        } else {
            unpack
        };

        let mut ssh = vec![ctx.settings.ssh.clone(), "-p".to_string(), client.port.to_string()];
        for option in &ctx.settings.ssh_options {
            ssh.push("-o".to_string());
            ssh.push(option.clone());
        }
        ssh.push(client.ssh_target());
        ssh.push(unpack);

        let pipeline = format!("{} | {}", shell::join(&export), shell::join(&ssh));
        let mut cmd = CommandLine::new(vec!["sh".to_string(), "-c".to_string(), pipeline])
            .with_optional_prompt(&SUDO_PROMPT, become_password);
        cmd.env = env::repository_env(ctx, true)?;
        Ok(cmd)
    }

    fn ssh_key<'a>(&self, ctx: &BuildContext<'a>) -> Option<(&'a Secret, Option<&'a Secret>)> {
        // The repository is read locally; the client is reached with its own
        // key, so prefer that one and fall back to the repository key.
        let client = ctx.client?;
        match client.credentials.ssh_private_key.as_ref() {
            Some(key) => Some((key, client.credentials.ssh_key_passphrase.as_ref())),
            None => repository_key(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::World;

    fn world() -> World {
        let mut world = World::new(JobType::Restore);
        world.job.archive_name = None;
        world.job.options = JobOptions {
            archive: Some("web1-40-2026-10-17T02:00:00".into()),
            paths: vec!["etc/hosts".into()],
            destination: Some("/srv/restore".into()),
        };
        world
    }

    #[test]
    fn test_restore_streams_tar_to_client() {
        let world = world();
        let cmd = RestoreBuilder.build(&world.ctx()).unwrap();
        let pipeline = &cmd.argv[2];
        assert!(pipeline.starts_with("borg export-tar ::web1-40-2026-10-17T02:00:00 - etc/hosts | ssh -p 22"));
        assert!(pipeline.contains("root@web1 'mkdir -p /srv/restore && tar -xpf - -C /srv/restore'"));
        assert_eq!(cmd.env["BORG_PASSPHRASE"], "correct horse");
    }

    #[test]
    fn test_restore_rejects_unresolved_latest() {
        let mut world = world();
        world.job.options.archive = Some("latest".into());
        assert!(matches!(
            RestoreBuilder.build(&world.ctx()),
            Err(BuildError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_restore_defaults_to_root() {
        let mut world = world();
        world.job.options.destination = None;
        let cmd = RestoreBuilder.build(&world.ctx()).unwrap();
        assert!(cmd.argv[2].contains("tar -xpf - -C /'"));
    }
}
