//! Dependency materialization.
//!
//! Before a job runs, its repository and the host its command runs on must
//! be prepared. For each subject the latest preparation job decides:
//! an unfinished one is attached as a blocker, and a new one is created when
//! there is none, when the latest is older than the recency window, or when
//! it finished but the subject is still not marked ready.
//!
//! Catalog jobs and dependency jobs themselves never get dependencies.

use crate::context::Context;
use crate::error::RuntimeResult;
use crate::settings::SchedulerSettings;
use bastion_core::{
    ClientId, Job, JobId, JobStatus, JobType, LaunchType, PolicyType, PrepareTarget, RepositoryId,
    Timestamp,
};
use std::time::Duration;

/// Created jobs sort ahead of the job that triggered them
const BACKDATE: Duration = Duration::from_secs(2);

/// Preparation jobs a trigger depends on
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    /// Created in this call, status `pending`, chained ahead of the trigger
    pub created: Vec<Job>,
    /// Already unfinished, attached without new work
    pub attached: Vec<Job>,
}

impl Dependencies {
    /// First preparation job that has not finished
    #[must_use]
    pub fn blocker(&self) -> Option<JobId> {
        self.created
            .iter()
            .chain(&self.attached)
            .find(|j| !j.is_terminal())
            .map(|j| j.id)
    }

    /// Whether nothing was created or attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.attached.is_empty()
    }
}

/// Whether `job` gets preparation dependencies at all
#[must_use]
pub fn needs_dependencies(job: &Job) -> bool {
    job.launch_type != LaunchType::Dependency && job.job_type != JobType::Catalog
}

struct Subject {
    target: PrepareTarget,
    client_id: Option<ClientId>,
    repository_id: Option<RepositoryId>,
    ready: bool,
}

async fn subjects(ctx: &Context, job: &Job) -> RuntimeResult<Vec<Subject>> {
    let mut subjects = Vec::new();
    if let Some(id) = job.repository_id {
        let repository = ctx.config.repository(id).await?;
        subjects.push(Subject {
            target: PrepareTarget::Repository,
            client_id: None,
            repository_id: Some(id),
            ready: repository.ready,
        });
    }
    if let Some(id) = job.client_id {
        let is_vm = match job.policy_id {
            Some(policy) => ctx.config.policy(policy).await?.policy_type == PolicyType::Vm,
            None => false,
        };
        let client = ctx.config.client(id).await?;
        let subject = match client.hypervisor_id.filter(|_| is_vm) {
            Some(hypervisor) => Subject {
                target: PrepareTarget::Hypervisor,
                client_id: Some(hypervisor),
                repository_id: None,
                ready: ctx.config.client(hypervisor).await?.ready,
            },
            None => Subject {
                target: PrepareTarget::Client,
                client_id: Some(id),
                repository_id: None,
                ready: client.ready,
            },
        };
        subjects.push(subject);
    }
    Ok(subjects)
}

/// Create or attach the preparation jobs `job` depends on
///
/// # Errors
///
/// Returns error if configuration or job records cannot be read or written
pub async fn materialize(
    ctx: &Context,
    settings: &SchedulerSettings,
    job: &Job,
) -> RuntimeResult<Dependencies> {
    let mut deps = Dependencies::default();
    if !needs_dependencies(job) {
        return Ok(deps);
    }

    let now = Timestamp::now();
    for subject in subjects(ctx, job).await? {
        let latest = ctx
            .jobs
            .latest_prepare_job(subject.target, subject.client_id, subject.repository_id)
            .await?;
        let create = match &latest {
            Some(prep) if !prep.is_terminal() => {
                deps.attached.push(prep.clone());
                false
            }
            Some(prep) => {
                let recent = now.duration_since(&prep.created) <= settings.prepare_recency();
                !recent || !subject.ready
            }
            None => true,
        };
        if !create {
            continue;
        }

        let mut prep = Job::new(JobId::new(0), JobType::Check, LaunchType::Dependency)
            .with_prepare(subject.target)
            .with_status(JobStatus::Pending)
            .with_created(now.backdated(BACKDATE))
            .with_dependent(job.id);
        prep.client_id = subject.client_id;
        prep.repository_id = subject.repository_id;
        let prep = ctx.jobs.create_job(prep).await?;
        ctx.notify_status(&prep);
        tracing::info!(
            job_id = %prep.id,
            trigger = %job.id,
            target = ?subject.target,
            "created preparation job"
        );
        deps.created.push(prep);
    }
    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::{self, World};
    use bastion_core::{Client, PolicyId};

    fn settings() -> SchedulerSettings {
        SchedulerSettings::default()
    }

    #[tokio::test]
    async fn test_fresh_install_creates_both() {
        let world = World::new();
        let backup = world.job(1, JobType::Backup, JobStatus::Pending, 0);
        let deps = materialize(&world.ctx, &settings(), &backup).await.unwrap();

        assert_eq!(deps.created.len(), 2);
        let targets: Vec<_> = deps.created.iter().map(|j| j.prepare).collect();
        assert_eq!(targets, vec![Some(PrepareTarget::Repository), Some(PrepareTarget::Client)]);
        for prep in &deps.created {
            assert_eq!(prep.launch_type, LaunchType::Dependency);
            assert_eq!(prep.job_type, JobType::Check);
            assert_eq!(prep.status, JobStatus::Pending);
            assert_eq!(prep.dependent_jobs_id, Some(backup.id));
            assert!(prep.policy_id.is_none());
            assert!(prep.created < backup.created);
        }
        assert_eq!(deps.created[0].repository_id, Some(RepositoryId::new(1)));
        assert_eq!(deps.created[0].client_id, None);
        assert_eq!(deps.created[1].client_id, Some(ClientId::new(1)));
        assert!(deps.blocker().is_some());
    }

    #[tokio::test]
    async fn test_recent_successful_preparation_is_enough() {
        let world = World::new();
        world.prepared(100);
        let backup = world.job(1, JobType::Backup, JobStatus::Pending, 0);
        let deps = materialize(&world.ctx, &settings(), &backup).await.unwrap();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn test_stale_preparation_is_redone() {
        let world = World::new();
        world.prepared(100);
        let backup = world.job(1, JobType::Backup, JobStatus::Pending, 0);
        let short = SchedulerSettings {
            prepare_recency_secs: 60,
            ..settings()
        };
        let deps = materialize(&world.ctx, &short, &backup).await.unwrap();
        assert_eq!(deps.created.len(), 2);
    }

    #[tokio::test]
    async fn test_not_ready_subject_is_redone() {
        let world = World::new();
        world.prepared(100);
        let mut repo = fixtures::repository(1);
        repo.ready = false;
        world.config.add_repository(repo);
        let backup = world.job(1, JobType::Backup, JobStatus::Pending, 0);
        let deps = materialize(&world.ctx, &settings(), &backup).await.unwrap();
        assert_eq!(deps.created.len(), 1);
        assert_eq!(deps.created[0].prepare, Some(PrepareTarget::Repository));
    }

    #[tokio::test]
    async fn test_active_preparation_is_attached() {
        let world = World::new();
        let first = world.job(1, JobType::Backup, JobStatus::Pending, 0);
        let created = materialize(&world.ctx, &settings(), &first).await.unwrap();

        let second = world.job(10, JobType::Prune, JobStatus::Pending, 0);
        let deps = materialize(&world.ctx, &settings(), &second).await.unwrap();
        assert!(deps.created.is_empty());
        let attached: Vec<_> = deps.attached.iter().map(|j| j.id).collect();
        let expected: Vec<_> = created.created.iter().map(|j| j.id).collect();
        assert_eq!(attached, expected);
        assert_eq!(world.store.jobs().len(), 4);
    }

    #[tokio::test]
    async fn test_catalog_and_dependency_jobs_are_exempt() {
        let world = World::new();
        let catalog = world.job(1, JobType::Catalog, JobStatus::Pending, 0);
        assert!(materialize(&world.ctx, &settings(), &catalog).await.unwrap().is_empty());

        let prep = Job::new(JobId::new(2), JobType::Check, LaunchType::Dependency)
            .with_prepare(PrepareTarget::Repository)
            .with_repository(RepositoryId::new(1));
        assert!(materialize(&world.ctx, &settings(), &prep).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vm_policy_prepares_hypervisor() {
        let world = World::new();
        let mut policy = fixtures::policy(2, 1, &[3]);
        policy.policy_type = PolicyType::Vm;
        world.config.add_policy(policy);
        world.config.add_client(Client {
            hypervisor_id: Some(ClientId::new(9)),
            ..fixtures::client(3)
        });
        world.config.add_client(Client {
            ready: false,
            ..fixtures::client(9)
        });
        world.prepared(100);

        let mut backup = world.job(1, JobType::Backup, JobStatus::Pending, 0);
        backup.policy_id = Some(PolicyId::new(2));
        backup.client_id = Some(ClientId::new(3));
        let deps = materialize(&world.ctx, &settings(), &backup).await.unwrap();
        assert_eq!(deps.created.len(), 1);
        assert_eq!(deps.created[0].prepare, Some(PrepareTarget::Hypervisor));
        assert_eq!(deps.created[0].client_id, Some(ClientId::new(9)));
    }
}
