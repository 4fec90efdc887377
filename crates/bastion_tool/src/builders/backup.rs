//! Backup jobs.
//!
//! Push mode: the host reaches the repository itself, with the staged key
//! forwarded through the agent. Pull mode: the repository is reached through
//! a reverse tunnel opened by the server's ssh session, on a port leased by
//! the executor. ssh exits if the port cannot be bound on the client.

use super::require_archive;
use crate::builder::CommandBuilder;
use crate::command::CommandLine;
use crate::context::BuildContext;
use crate::env;
use crate::error::BuildError;
use crate::remote::RemoteBootstrap;
use crate::shell;
use bastion_core::{BackupMode, JobType, PolicyType};


/// Builds `backup` jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct BackupBuilder;

/// Parts of an `ssh://user@host:port/path` repository URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SshUrl {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: String,
}

pub(crate) fn parse_ssh_url(url: &str) -> Option<SshUrl> {
    let rest = url.strip_prefix("ssh://")?;
    let (authority, path) = rest.split_once('/')?;
    let (user, hostport) = match authority.rsplit_once('@') {
        Some((user, hostport)) => (Some(user.split(':').next().unwrap_or(user).to_string()), hostport),
        None => (None, authority),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (hostport, 22),
    };
    if host.is_empty() {
        return None;
    }
    Some(SshUrl {
        user,
        host: host.to_string(),
        port,
        path: format!("/{}", path),
    })
}

impl BackupBuilder {
    fn create_line(&self, ctx: &BuildContext<'_>, archive: &str) -> Result<String, BuildError> {
        let policy = ctx.require_policy()?;
        let mut create = vec![
            ctx.settings.borg.clone(),
            "create".to_string(),
            "--stats".to_string(),
            "--show-rc".to_string(),
            "--compression".to_string(),
            policy.compression.clone(),
        ];
        for pattern in &policy.excludes {
            create.push("--exclude".to_string());
            create.push(pattern.clone());
        }
        let target = format!("::{}", archive);

        match policy.policy_type {
            PolicyType::Filesystem => {
                if policy.paths.is_empty() {
                    return Err(BuildError::InvalidOptions {
                        job: ctx.job.id,
                        reason: "filesystem policy has no paths".to_string(),
                    });
                }
                create.push(target);
                create.extend(policy.paths.iter().cloned());
                Ok(shell::join(&create))
            }
            PolicyType::Database => {
                let dump = policy
                    .dump_command
                    .as_deref()
                    .filter(|d| !d.trim().is_empty())
                    .ok_or_else(|| BuildError::InvalidOptions {
                        job: ctx.job.id,
                        reason: "database policy has no dump command".to_string(),
                    })?;
                create.extend(["--stdin-name".to_string(), "dump".to_string(), target, "-".to_string()]);
                Ok(format!("{} | {}", dump, shell::join(&create)))
            }
            PolicyType::Vm => {
                let domain = ctx.require_client()?.hostname.clone();
                create.push("--read-special".to_string());
                create.push(target);
                Ok(format!(
                    "disks=$(virsh domblklist --details {} | awk '$2 == \"disk\" {{print $4}}')\n[ -n \"$disks\" ] || {{ echo \"no disks found for {}\"; exit 4; }}\n{} $disks",
                    shell::quote(&domain),
                    domain,
                    shell::join(&create)
                ))
            }
        }
    }
}

impl CommandBuilder for BackupBuilder {
    fn job_type(&self) -> JobType {
        JobType::Backup
    }

    fn needs_tunnel(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.policy.is_some_and(|p| p.mode == BackupMode::Pull)
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
        let policy = ctx.require_policy()?;
        let repository = ctx.require_repository()?;
        let host = ctx.remote_host()?;
        let archive = require_archive(ctx)?;

        let mut repo_env = env::repository_env(ctx, false)?;
        let mut forward = Vec::new();
        match policy.mode {
            BackupMode::Push => forward.push("-A".to_string()),
            BackupMode::Pull => {
                let url = parse_ssh_url(&repository.url).ok_or_else(|| BuildError::InvalidOptions {
                    job: ctx.job.id,
                    reason: "pull mode needs an ssh:// repository".to_string(),
                })?;
                let port = ctx.tunnel_port.ok_or(BuildError::MissingConfig {
                    job: ctx.job.id,
                    what: "tunnel port",
                })?;
                forward.push("-o".to_string());
                forward.push("ExitOnForwardFailure=yes".to_string());
                forward.push("-R".to_string());
                forward.push(format!("127.0.0.1:{}:{}:{}", port, url.host, url.port));
                let user = url.user.map(|u| format!("{}@", u)).unwrap_or_default();
                repo_env.insert(
                    "BORG_REPO".to_string(),
                    format!("ssh://{}127.0.0.1:{}{}", user, port, url.path),
                );
            }
        }

        RemoteBootstrap::new(*ctx, host)
            .with_env(repo_env)
            .with_run_flags(forward)
            .line(self.create_line(ctx, &archive)?)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::World;
    use crate::remote::{ENV_FILE, SCRIPT_FILE};

    fn script(cmd: &CommandLine) -> String {
        cmd.files
            .iter()
            .find(|f| f.name == SCRIPT_FILE)
            .map(|f| f.contents.expose().to_string())
            .unwrap()
    }

    #[test]
    fn test_filesystem_push() {
        let world = World::new(JobType::Backup);
        let cmd = BackupBuilder.build(&world.ctx()).unwrap();
        let body = script(&cmd);
        assert!(body.contains(
            "borg create --stats --show-rc --compression zstd,3 --exclude '*.tmp' ::web1-42-2026-10-18T02:00:00 /etc /home"
        ));
        assert!(cmd.argv[2].contains("exec ssh -tt -A"));
        let env_file = cmd.files.iter().find(|f| f.name == ENV_FILE).unwrap();
        assert!(env_file.contents.expose().contains("BORG_REPO=ssh://borg@vault.example:22/srv/borg/main"));
        assert!(!env_file.contents.expose().contains("correct horse"));
        assert_eq!(cmd.prompts.len(), 1);
    }

    #[test]
    fn test_pull_mode_tunnels_repository() {
        let mut world = World::new(JobType::Backup);
        world.policy.mode = BackupMode::Pull;
        let cmd = BackupBuilder.build(&world.ctx()).unwrap();
        assert!(cmd.argv[2].contains("-R 127.0.0.1:40042:vault.example:22"));
        let env_file = cmd.files.iter().find(|f| f.name == ENV_FILE).unwrap();
        assert!(env_file
            .contents
            .expose()
            .contains("BORG_REPO=ssh://borg@127.0.0.1:40042/srv/borg/main"));
    }

    #[test]
    fn test_pull_mode_uses_leased_port_and_fails_fast() {
        let mut world = World::new(JobType::Backup);
        world.policy.mode = BackupMode::Pull;
        let mut ctx = world.ctx();
        assert!(BackupBuilder.needs_tunnel(&ctx));
        ctx.tunnel_port = Some(40043);
        let cmd = BackupBuilder.build(&ctx).unwrap();
        assert!(cmd.argv[2].contains("-o ExitOnForwardFailure=yes -R 127.0.0.1:40043:vault.example:22"));

        ctx.tunnel_port = None;
        assert!(matches!(
            BackupBuilder.build(&ctx),
            Err(BuildError::MissingConfig { what: "tunnel port", .. })
        ));
    }

    #[test]
    fn test_push_mode_needs_no_tunnel() {
        let world = World::new(JobType::Backup);
        assert!(!BackupBuilder.needs_tunnel(&world.ctx()));
    }

    #[test]
    fn test_database_pipes_dump() {
        let mut world = World::new(JobType::Backup);
        world.policy.policy_type = PolicyType::Database;
        world.policy.dump_command = Some("pg_dumpall".into());
        let body = script(&BackupBuilder.build(&world.ctx()).unwrap());
        assert!(body.contains("pg_dumpall | borg create"));
        assert!(body.contains("--stdin-name dump"));
    }

    #[test]
    fn test_vm_runs_on_hypervisor() {
        let mut world = World::new(JobType::Backup);
        world.policy.policy_type = PolicyType::Vm;
        let cmd = BackupBuilder.build(&world.ctx()).unwrap();
        assert!(cmd.argv[2].contains("root@kvm1"));
        assert!(script(&cmd).contains("virsh domblklist --details web1"));
    }

    #[test]
    fn test_missing_archive_name() {
        let mut world = World::new(JobType::Backup);
        world.job.archive_name = None;
        assert!(matches!(
            BackupBuilder.build(&world.ctx()),
            Err(BuildError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_parse_ssh_url() {
        assert_eq!(
            parse_ssh_url("ssh://borg@vault:2222/srv/repo"),
            Some(SshUrl {
                user: Some("borg".into()),
                host: "vault".into(),
                port: 2222,
                path: "/srv/repo".into()
            })
        );
        assert_eq!(parse_ssh_url("/srv/local").map(|u| u.host), None);
        assert_eq!(parse_ssh_url("ssh://vault/srv").unwrap().port, 22);
    }
}
