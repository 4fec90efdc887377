//! Prune jobs, run from the server against the repository.

use crate::builder::{repository_key, CommandBuilder};
use crate::command::CommandLine;
use crate::context::BuildContext;
use crate::env;
use crate::error::BuildError;
use bastion_core::{JobType, Secret};

/// Builds `prune` jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneBuilder;

impl CommandBuilder for PruneBuilder {
    fn job_type(&self) -> JobType {
        JobType::Prune
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
        let policy = ctx.require_policy()?;
        let client = ctx.require_client()?;
        let repository = ctx.require_repository()?;
        if !policy.retention.is_set() {
            return Err(BuildError::InvalidOptions {
                job: ctx.job.id,
                reason: format!("policy {} has no retention configured", policy.id),
            });
        }

        // Only archives of this client; names are `<hostname>-<job>-<time>`.
        let mut argv = vec![
            ctx.settings.borg.clone(),
            "prune".to_string(),
            "--list".to_string(),
            "--stats".to_string(),
            "--show-rc".to_string(),
            "--glob-archives".to_string(),
            format!("{}-*", client.hostname),
        ];
        for (flag, count) in policy.retention.flags() {
            argv.push(flag.to_string());
            argv.push(count.to_string());
        }
        argv.push(repository.url.clone());

        let mut cmd = CommandLine::new(argv);
        cmd.env = env::repository_env(ctx, true)?;
        Ok(cmd)
    }

    fn ssh_key<'a>(&self, ctx: &BuildContext<'a>) -> Option<(&'a Secret, Option<&'a Secret>)> {
        repository_key(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::World;
    use bastion_core::Retention;

    #[test]
    fn test_prune_flags_from_retention() {
        let world = World::new(JobType::Prune);
        let cmd = PruneBuilder.build(&world.ctx()).unwrap();
        assert_eq!(
            cmd.argv,
            vec![
                "borg",
                "prune",
                "--list",
                "--stats",
                "--show-rc",
                "--glob-archives",
                "web1-*",
                "--keep-daily",
                "7",
                "--keep-weekly",
                "4",
                "ssh://borg@vault.example:22/srv/borg/main",
            ]
        );
        assert_eq!(cmd.env["BORG_PASSPHRASE"], "correct horse");
        assert!(cmd.files.is_empty());
    }

    #[test]
    fn test_prune_without_retention_is_rejected() {
        let mut world = World::new(JobType::Prune);
        world.policy.retention = Retention::default();
        assert!(matches!(
            PruneBuilder.build(&world.ctx()),
            Err(BuildError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_prune_stages_repository_key() {
        let mut world = World::new(JobType::Prune);
        world.repository.credentials.ssh_private_key = Some(Secret::new("repo-key"));
        let ctx = world.ctx();
        let (key, _) = PruneBuilder.ssh_key(&ctx).unwrap();
        assert_eq!(key.expose(), "repo-key");
    }
}
