//! Job-type specific hooks around a run.

use crate::context::Context;
use crate::outcome::RunOutcome;
use bastion_core::{Client, Job, JobType, JobUpdate, LaunchType, Notification, PrepareTarget, Timestamp};
use bastion_storage::{ReadyTarget, StoreError};

/// Why a pre-run hook stopped the job
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The job cannot run as configured
    #[error("{0}")]
    Unresolved(String),

    /// Storage failed while resolving
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Archive name for a backup of `host`
#[must_use]
pub fn archive_name(host: &str, job: &Job, at: Timestamp) -> String {
    format!("{}-{}-{}", host, job.id.as_u64(), at.compact())
}

/// Resolve whatever the command builder needs from earlier jobs
///
/// Returns the job as it should be built.
///
/// # Errors
///
/// Returns error if the job cannot be resolved or storage failed
pub async fn before_run(ctx: &Context, job: Job, client: Option<&Client>) -> Result<Job, HookError> {
    match job.job_type {
        JobType::Backup if job.archive_name.is_none() => {
            let host = client
                .map(|c| c.hostname.as_str())
                .ok_or_else(|| HookError::Unresolved("backup job has no client".to_string()))?;
            let name = archive_name(host, &job, Timestamp::now());
            Ok(ctx
                .update(job.id, &JobUpdate::default().with_archive_name(name))
                .await?)
        }
        JobType::Catalog if job.archive_name.is_none() => {
            let name = resolve_catalog_source(ctx, &job).await?;
            tracing::debug!(job_id = %job.id, archive = %name, "catalog source resolved");
            Ok(ctx
                .update(job.id, &JobUpdate::default().with_archive_name(name))
                .await?)
        }
        _ => Ok(job),
    }
}

async fn resolve_catalog_source(ctx: &Context, job: &Job) -> Result<String, HookError> {
    let predecessors = ctx.jobs.predecessors_of(job.id).await?;
    if let Some(source) = predecessors.iter().find(|p| p.job_type == JobType::Backup) {
        if !source.status.is_terminal() || source.failed {
            return Err(HookError::Unresolved(format!(
                "source backup {} did not succeed",
                source.id
            )));
        }
        return source
            .archive_name
            .clone()
            .ok_or_else(|| HookError::Unresolved(format!("source backup {} has no archive", source.id)));
    }
    ctx.jobs
        .latest_successful_backup(job.client_id, job.repository_id)
        .await?
        .and_then(|backup| backup.archive_name)
        .ok_or_else(|| HookError::Unresolved("no successful backup to catalog".to_string()))
}

/// Side effects of a finished run
///
/// Failures are logged; they never change the outcome.
pub async fn after_run(ctx: &Context, job: &Job, outcome: &RunOutcome) {
    if !outcome.is_success() {
        return;
    }
    if job.job_type == JobType::Backup && job.launch_type != LaunchType::Dependency && job.prepare.is_none() {
        ctx.notifier.publish(Notification::after_backup(job));
    }
    if let Some(target) = ready_target(job) {
        if let Err(err) = ctx.config.mark_ready(target).await {
            tracing::warn!(job_id = %job.id, ?target, error = %err, "failed to mark ready");
        }
    }
}

fn ready_target(job: &Job) -> Option<ReadyTarget> {
    if job.launch_type != LaunchType::Dependency {
        return None;
    }
    match job.prepare? {
        PrepareTarget::Repository => job.repository_id.map(ReadyTarget::Repository),
        PrepareTarget::Client | PrepareTarget::Hypervisor => job.client_id.map(ReadyTarget::Client),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::{self, World};
    use bastion_core::{ClientId, JobId, JobStatus, RepositoryId};
    use bastion_storage::ConfigSource;

    #[tokio::test]
    async fn test_backup_gets_archive_name() {
        let world = World::new();
        let job = world.job(10, JobType::Backup, JobStatus::Running, 0);
        let client = fixtures::client(1);
        let job = before_run(&world.ctx, job, Some(&client)).await.unwrap();
        let name = job.archive_name.unwrap();
        assert!(name.starts_with("host1-10-"));
    }

    #[tokio::test]
    async fn test_catalog_uses_chain_predecessor() {
        let world = World::new();
        let mut backup = world.job(10, JobType::Backup, JobStatus::Running, 5);
        backup.status = JobStatus::Successful;
        backup.archive_name = Some("host1-10-2026-10-18T01:00:00".into());
        backup.dependent_jobs_id = Some(JobId::new(11));
        world.store.insert_job(backup);
        let catalog = world.job(11, JobType::Catalog, JobStatus::Running, 0);

        let job = before_run(&world.ctx, catalog, None).await.unwrap();
        assert_eq!(job.archive_name.as_deref(), Some("host1-10-2026-10-18T01:00:00"));
    }

    #[tokio::test]
    async fn test_catalog_after_failed_backup_is_unresolved() {
        let world = World::new();
        let mut backup = world.job(10, JobType::Backup, JobStatus::Running, 5);
        backup.status = JobStatus::Failed;
        backup.failed = true;
        backup.dependent_jobs_id = Some(JobId::new(11));
        world.store.insert_job(backup);
        let catalog = world.job(11, JobType::Catalog, JobStatus::Running, 0);

        let err = before_run(&world.ctx, catalog, None).await.unwrap_err();
        assert!(matches!(err, HookError::Unresolved(_)));
    }

    #[tokio::test]
    async fn test_catalog_without_any_backup() {
        let world = World::new();
        let catalog = world.job(11, JobType::Catalog, JobStatus::Running, 0);
        let err = before_run(&world.ctx, catalog, None).await.unwrap_err();
        assert!(err.to_string().contains("no successful backup"));
    }

    #[tokio::test]
    async fn test_dependency_success_marks_ready() {
        let world = World::new();
        let mut repo = fixtures::repository(1);
        repo.ready = false;
        world.config.add_repository(repo);

        let mut job = Job::new(JobId::new(5), JobType::Check, LaunchType::Dependency)
            .with_prepare(PrepareTarget::Repository)
            .with_repository(RepositoryId::new(1));
        job.client_id = None;
        after_run(&world.ctx, &job, &RunOutcome::Success).await;
        assert!(world.config.repository(RepositoryId::new(1)).await.unwrap().ready);
    }

    #[tokio::test]
    async fn test_after_backup_only_for_plain_backups() {
        let world = World::new();
        let backup = Job::new(JobId::new(1), JobType::Backup, LaunchType::Scheduled)
            .with_client(ClientId::new(1));
        after_run(&world.ctx, &backup, &RunOutcome::Success).await;
        let prune = Job::new(JobId::new(2), JobType::Prune, LaunchType::Scheduled);
        after_run(&world.ctx, &prune, &RunOutcome::Success).await;
        let failed = RunOutcome::Failed { rc: Some(2), reason: "rc 2".into() };
        after_run(&world.ctx, &backup, &failed).await;
        let sent = world.notifier.in_group(bastion_core::notify::GROUP_AFTER_BACKUP);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].job_id, Some(JobId::new(1)));
    }
}
