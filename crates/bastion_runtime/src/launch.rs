//! Policy launch and job submission.

use crate::context::Context;
use crate::error::RuntimeResult;
use bastion_core::{Job, JobId, JobStatus, JobUpdate, LaunchType, Notification, PolicyId};
use bastion_policy::expand_policy;
use bastion_storage::StoreError;

/// Expand a policy into per-client chains and queue their heads
///
/// Chains are persisted head first and linked through
/// `dependent_jobs_id`; heads move to `pending`, the rest stay `waiting`.
/// Returns every created job id, chain by chain.
///
/// # Errors
///
/// Returns error if the policy cannot be loaded or expanded, or if
/// storage fails
pub async fn launch_policy(
    ctx: &Context,
    policy_id: PolicyId,
    launch_type: LaunchType,
) -> RuntimeResult<Vec<JobId>> {
    let policy = ctx.config.policy(policy_id).await?;
    let mut clients = Vec::with_capacity(policy.client_ids.len());
    for id in &policy.client_ids {
        match ctx.config.client(*id).await {
            Ok(client) => clients.push(client),
            Err(err @ StoreError::NotFound { .. }) => {
                tracing::warn!(policy_id = %policy.id, client_id = %id, error = %err, "skipping client");
            }
            Err(err) => return Err(err.into()),
        }
    }
    let chains = expand_policy(&policy, &clients, launch_type)?;

    let mut created = Vec::new();
    let mut heads = Vec::new();
    for chain in chains {
        let mut previous: Option<Job> = None;
        for template in chain.into_jobs() {
            let job = ctx.jobs.create_job(template).await?;
            created.push(job.id);
            match previous {
                Some(prev) => {
                    ctx.update(prev.id, &JobUpdate::default().with_dependent(job.id))
                        .await?;
                }
                None => heads.push(job.id),
            }
            previous = Some(job);
        }
    }

    for head in &heads {
        ctx.update(*head, &JobUpdate::status(JobStatus::Pending)).await?;
    }
    tracing::info!(
        policy_id = %policy.id,
        chains = heads.len(),
        jobs = created.len(),
        "policy launched"
    );
    ctx.notifier.publish(Notification::schedule_advanced(policy.id));
    ctx.wake_scheduler();
    Ok(created)
}

/// Persist a single job and queue it
///
/// # Errors
///
/// Returns error if storage fails
pub async fn submit_job(ctx: &Context, job: Job) -> RuntimeResult<Job> {
    let job = ctx.jobs.create_job(job).await?;
    let job = if job.status == JobStatus::New {
        ctx.update(job.id, &JobUpdate::status(JobStatus::Pending)).await?
    } else {
        job
    };
    tracing::info!(job_id = %job.id, job_type = %job.job_type, "job submitted");
    ctx.wake_scheduler();
    Ok(job)
}
