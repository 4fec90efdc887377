//! Builders for each job type.

mod backup;
mod catalog;
mod check;
mod prune;
mod restore;

pub use backup::BackupBuilder;
pub use catalog::CatalogBuilder;
pub use check::CheckBuilder;
pub use prune::PruneBuilder;
pub use restore::RestoreBuilder;

use crate::context::BuildContext;
use crate::error::BuildError;

/// Archive name assigned by the executor before building
pub(crate) fn require_archive(ctx: &BuildContext<'_>) -> Result<String, BuildError> {
    ctx.job
        .archive_name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| BuildError::InvalidOptions {
            job: ctx.job.id,
            reason: "archive name is not assigned".to_string(),
        })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::context::{BuildContext, ToolSettings};
    use bastion_core::{
        BackupMode, Client, ClientId, Credentials, Job, JobId, JobType, LaunchType, Policy,
        PolicyId, PolicyType, Repository, RepositoryId, Retention, Secret,
    };
    use std::path::Path;

    pub struct World {
        pub job: Job,
        pub policy: Policy,
        pub client: Client,
        pub hypervisor: Client,
        pub repository: Repository,
        pub settings: ToolSettings,
    }

    impl World {
        pub fn new(job_type: JobType) -> Self {
            let mut job = Job::new(JobId::new(42), job_type, LaunchType::Scheduled)
                .with_policy(PolicyId::new(1))
                .with_client(ClientId::new(1))
                .with_repository(RepositoryId::new(1));
            job.archive_name = Some("web1-42-2026-10-18T02:00:00".to_string());
            Self {
                job,
                policy: Policy {
                    id: PolicyId::new(1),
                    name: "nightly".into(),
                    policy_type: PolicyType::Filesystem,
                    enabled: true,
                    repository_id: RepositoryId::new(1),
                    client_ids: vec![ClientId::new(1)],
                    retention: Retention {
                        keep_daily: Some(7),
                        keep_weekly: Some(4),
                        ..Retention::default()
                    },
                    catalog_enabled: true,
                    auto_prune: true,
                    mode: BackupMode::Push,
                    paths: vec!["/etc".into(), "/home".into()],
                    excludes: vec!["*.tmp".into()],
                    compression: "zstd,3".into(),
                    dump_command: None,
                    timeout_secs: None,
                },
                client: Client {
                    id: ClientId::new(1),
                    hostname: "web1".into(),
                    port: 22,
                    username: "root".into(),
                    enabled: true,
                    ready: true,
                    hypervisor_id: Some(ClientId::new(9)),
                    remote_dir: "/tmp/.bastion".into(),
                    credentials: Credentials {
                        ssh_private_key: Some(Secret::new("-----BEGIN KEY-----")),
                        ..Credentials::default()
                    },
                },
                hypervisor: Client {
                    id: ClientId::new(9),
                    hostname: "kvm1".into(),
                    port: 22,
                    username: "root".into(),
                    enabled: true,
                    ready: true,
                    hypervisor_id: None,
                    remote_dir: "/tmp/.bastion".into(),
                    credentials: Credentials::default(),
                },
                repository: Repository {
                    id: RepositoryId::new(1),
                    name: "vault".into(),
                    url: "ssh://borg@vault.example:22/srv/borg/main".into(),
                    ready: true,
                    credentials: Credentials {
                        repository_passphrase: Some(Secret::new("correct horse")),
                        ..Credentials::default()
                    },
                },
                settings: ToolSettings::default(),
            }
        }

        pub fn ctx(&self) -> BuildContext<'_> {
            BuildContext {
                job: &self.job,
                policy: Some(&self.policy),
                client: Some(&self.client),
                hypervisor: Some(&self.hypervisor),
                repository: Some(&self.repository),
                scratch_dir: Path::new("/run/bastion/job-42"),
                staged_key: None,
                tunnel_port: Some(40042),
                settings: &self.settings,
            }
        }
    }
}
