//! Job cancellation.
//!
//! Jobs that have not started are canceled on the spot, together with the
//! unstarted rest of their chain. Jobs that are starting or running only
//! get their cancel flag set; the runner notices it at its next check, so
//! cancellation is bounded by the check interval.

use crate::context::Context;
use crate::error::RuntimeResult;
use bastion_core::{Job, JobId, JobStatus, JobUpdate};
use bastion_storage::StoreError;
use serde::{Deserialize, Serialize};

const CANCELED: &str = "Job was canceled";

/// What a cancel request did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job is now `canceled`; no process was started
    Canceled,
    /// The flag is set; the runner will terminate the process
    Requested,
    /// The job had already finished
    AlreadyFinished,
}

/// Cancel job `id`
///
/// # Errors
///
/// Returns error if the job cannot be loaded or updated
pub async fn cancel_job(ctx: &Context, id: JobId) -> RuntimeResult<CancelOutcome> {
    let job = ctx.jobs.get_job(id).await?;
    if job.is_terminal() {
        return Ok(CancelOutcome::AlreadyFinished);
    }

    if job.status.is_cancelable_synchronously() {
        match cancel_unstarted(ctx, &job).await {
            Ok(()) => {
                cancel_successors(ctx, &job).await;
                ctx.wake_scheduler();
                return Ok(CancelOutcome::Canceled);
            }
            // The scheduler started it in the meantime.
            Err(StoreError::Rejected(err)) => {
                tracing::debug!(job_id = %id, error = %err, "job started while canceling");
            }
            Err(err) => return Err(err.into()),
        }
    }

    ctx.update(id, &JobUpdate::default().with_cancel_flag(true)).await?;
    tracing::info!(job_id = %id, status = %job.status, "cancel requested");
    Ok(CancelOutcome::Requested)
}

async fn cancel_unstarted(ctx: &Context, job: &Job) -> Result<(), StoreError> {
    let update =
        JobUpdate::status_with_explanation(JobStatus::Canceled, CANCELED).with_cancel_flag(true);
    ctx.update(job.id, &update).await?;
    tracing::info!(job_id = %job.id, "job canceled before start");
    Ok(())
}

async fn cancel_successors(ctx: &Context, job: &Job) {
    let mut next = job.dependent_jobs_id;
    while let Some(id) = next {
        let successor = match ctx.jobs.get_job(id).await {
            Ok(successor) => successor,
            Err(err) => {
                tracing::warn!(job_id = %id, error = %err, "cannot load chain successor");
                return;
            }
        };
        if !successor.status.is_cancelable_synchronously() {
            return;
        }
        if let Err(err) = cancel_unstarted(ctx, &successor).await {
            tracing::warn!(job_id = %id, error = %err, "cannot cancel chain successor");
            return;
        }
        next = successor.dependent_jobs_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::World;
    use crate::dispatch::RecordingDispatcher;
    use crate::executor::JobRunner;
    use crate::scheduler::Scheduler;
    use crate::settings::{ExecutorSettings, SchedulerSettings};
    use bastion_core::JobType;
    use bastion_storage::{JobStore, LocalLock};
    use bastion_tool::{BuildContext, BuildError, BuilderRegistry, CommandBuilder, CommandLine};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts every command it is asked to build
    #[derive(Default)]
    struct CountingBuilder {
        builds: AtomicUsize,
    }

    impl CommandBuilder for CountingBuilder {
        fn job_type(&self) -> JobType {
            JobType::Backup
        }

        fn build(&self, _ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(CommandLine::new(vec!["/bin/true".into()]))
        }
    }

    #[tokio::test]
    async fn test_cancel_new_job_is_synchronous() {
        let world = World::new();
        world.job(1, JobType::Backup, JobStatus::New, 0);
        let outcome = cancel_job(&world.ctx, JobId::new(1)).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Canceled);

        let job = world.store.get_job(JobId::new(1)).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.failed);
        assert!(job.cancel_flag);
        assert!(job.finished.is_some());
        assert_eq!(job.elapsed, Some(0.0));
    }

    #[tokio::test]
    async fn test_canceled_unstarted_jobs_never_reach_a_process() {
        let world = World::new();
        world.prepared(100);
        world.job(1, JobType::Backup, JobStatus::New, 30);
        world.job(2, JobType::Backup, JobStatus::Pending, 20);
        world.job(3, JobType::Backup, JobStatus::Waiting, 10);
        for id in 1..=3 {
            let outcome = cancel_job(&world.ctx, JobId::new(id)).await.unwrap();
            assert_eq!(outcome, CancelOutcome::Canceled);
        }

        let recorder = Arc::new(RecordingDispatcher::new());
        let scheduler = Scheduler::new(
            world.ctx.clone(),
            SchedulerSettings::default(),
            Arc::new(LocalLock::new()),
            recorder.clone(),
            recorder.clone(),
        );
        scheduler.schedule().await.unwrap();
        assert!(recorder.job_ids().is_empty());

        let builder = Arc::new(CountingBuilder::default());
        let mut registry = BuilderRegistry::new();
        registry.register(builder.clone()).unwrap();
        let runner = JobRunner::new(world.ctx.clone().with_builders(registry), ExecutorSettings::default());
        for id in 1..=3 {
            runner.run(JobId::new(id)).await.unwrap();
        }
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
        assert!(world
            .store
            .jobs()
            .iter()
            .filter(|j| j.id.as_u64() <= 3)
            .all(|j| j.status == JobStatus::Canceled));
    }

    #[tokio::test]
    async fn test_cancel_running_only_sets_flag() {
        let world = World::new();
        world.job(1, JobType::Backup, JobStatus::Running, 0);
        let outcome = cancel_job(&world.ctx, JobId::new(1)).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Requested);

        let job = world.store.get_job(JobId::new(1)).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.cancel_flag);
        assert!(job.finished.is_none());
    }

    #[tokio::test]
    async fn test_cancel_finished_job() {
        let world = World::new();
        world.job(1, JobType::Backup, JobStatus::Successful, 0);
        assert_eq!(
            cancel_job(&world.ctx, JobId::new(1)).await.unwrap(),
            CancelOutcome::AlreadyFinished
        );
    }

    #[tokio::test]
    async fn test_cancel_head_cancels_waiting_chain() {
        let world = World::new();
        let mut backup = world.job(1, JobType::Backup, JobStatus::Pending, 0);
        backup.dependent_jobs_id = Some(JobId::new(2));
        world.store.insert_job(backup);
        let mut catalog = world.job(2, JobType::Catalog, JobStatus::Waiting, 0);
        catalog.dependent_jobs_id = Some(JobId::new(3));
        world.store.insert_job(catalog);
        world.job(3, JobType::Prune, JobStatus::Waiting, 0);

        cancel_job(&world.ctx, JobId::new(1)).await.unwrap();
        assert!(world
            .store
            .jobs()
            .iter()
            .all(|j| j.status == JobStatus::Canceled));
    }
}
