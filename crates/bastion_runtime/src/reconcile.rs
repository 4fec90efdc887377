//! Reconciliation of the job table with live processes.
//!
//! A worker crash leaves jobs in `starting`/`running` that nothing will
//! ever finish. Any such job whose correlation id is not in the live
//! registry, and which was not modified since it was loaded, is failed.

use crate::context::Context;
use crate::dispatch::ProcessRegistry;
use crate::error::RuntimeResult;
use bastion_core::{JobId, JobStatus, JobUpdate};
use std::sync::Arc;

const ORPHANED: &str = "Task was marked as running but was not present in the process registry, \
so it has been marked as failed.";

/// Fails orphaned jobs
#[derive(Clone)]
pub struct Reconciler {
    ctx: Context,
    registry: Arc<dyn ProcessRegistry>,
}

impl Reconciler {
    /// Create a reconciler reading live handles from `registry`
    #[must_use]
    pub fn new(ctx: Context, registry: Arc<dyn ProcessRegistry>) -> Self {
        Self { ctx, registry }
    }

    /// Run one pass
    ///
    /// Returns the jobs that were failed.
    ///
    /// # Errors
    ///
    /// Returns error if active jobs cannot be loaded
    pub async fn reconcile(&self) -> RuntimeResult<Vec<JobId>> {
        // Live handles first: a task that ends after this point has already
        // finalized its job before the job list is read.
        let live = self.registry.live();
        let jobs = self.ctx.jobs.jobs_with_status(&JobStatus::ACTIVE).await?;

        let mut failed = Vec::new();
        for job in jobs {
            if job.celery_task_id.is_some_and(|id| live.contains(&id)) {
                continue;
            }
            let update = JobUpdate::status_with_explanation(JobStatus::Failed, ORPHANED);
            match self
                .ctx
                .jobs
                .update_if_unmodified(job.id, job.modified, &update)
                .await
            {
                Ok(Some(updated)) => {
                    tracing::warn!(job_id = %job.id, status = %job.status, "failed orphaned job");
                    self.ctx.notify_status(&updated);
                    failed.push(job.id);
                }
                Ok(None) => {
                    tracing::debug!(job_id = %job.id, "job changed during reconciliation");
                }
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "failed to reconcile job");
                }
            }
        }
        Ok(failed)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}
