//! Task dispatch.
//!
//! The scheduler hands admitted jobs to a [`TaskDispatcher`]. The local
//! dispatcher runs each job on the tokio runtime and keeps the set of live
//! correlation ids, which reconciliation compares against the job table.
//! When a run fails, its error continuation fails the jobs bound to it and
//! wakes the scheduler.

use crate::context::Context;
use crate::executor::JobRunner;
use crate::outcome::TaskError;
use bastion_core::{CorrelationId, JobId, JobStatus, JobUpdate};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::task::TaskTracker;

/// A job admitted for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Job to run
    pub job_id: JobId,
    /// Handle recorded on the job as `celery_task_id`
    pub correlation_id: CorrelationId,
    /// Jobs failed along with this one if it does not succeed
    pub fail_with: Vec<JobId>,
}

/// Starts admitted jobs
pub trait TaskDispatcher: Send + Sync {
    /// Begin running `task`; must not block
    fn dispatch(&self, task: Task);
}

/// Live external process handles
pub trait ProcessRegistry: Send + Sync {
    /// Correlation ids of tasks still running
    fn live(&self) -> HashSet<CorrelationId>;
}

/// Runs tasks in this process
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    runner: JobRunner,
    ctx: Context,
    live: Arc<Mutex<HashSet<CorrelationId>>>,
    tracker: TaskTracker,
}

impl LocalDispatcher {
    /// Create a dispatcher running jobs with `runner`
    #[must_use]
    pub fn new(ctx: Context, runner: JobRunner) -> Self {
        Self {
            runner,
            ctx,
            live: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Number of tasks still running
    #[must_use]
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting tasks and wait for running ones
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait until every dispatched task has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl TaskDispatcher for LocalDispatcher {
    fn dispatch(&self, task: Task) {
        if self.tracker.is_closed() {
            tracing::warn!(job_id = %task.job_id, "dispatcher is shut down, task not started");
            return;
        }
        if let Ok(mut live) = self.live.lock() {
            live.insert(task.correlation_id);
        }
        let runner = self.runner.clone();
        let ctx = self.ctx.clone();
        let live = Arc::clone(&self.live);
        self.tracker.spawn(async move {
            tracing::debug!(job_id = %task.job_id, correlation_id = %task.correlation_id, "task started");
            if let Err(err) = runner.run(task.job_id).await {
                on_failure(&ctx, &err, &task.fail_with).await;
            }
            if let Ok(mut live) = live.lock() {
                live.remove(&task.correlation_id);
            }
            ctx.wake_scheduler();
        });
    }
}

impl ProcessRegistry for LocalDispatcher {
    fn live(&self) -> HashSet<CorrelationId> {
        self.live.lock().map(|live| live.clone()).unwrap_or_default()
    }
}

/// Error continuation of a task
///
/// Fails the task's own job if it is somehow still open, then every bound
/// job that has not started. Bound jobs already running are left to finish.
pub async fn on_failure(ctx: &Context, err: &TaskError, fail_with: &[JobId]) {
    let source = err.job();
    if err.is_cancel() {
        tracing::info!(job_id = %source, "task canceled");
    } else {
        tracing::warn!(job_id = %source, error = %err, "task failed");
    }
    for id in std::iter::once(source).chain(fail_with.iter().copied()) {
        let job = match ctx.jobs.get_job(id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "cannot load job to cascade failure");
                continue;
            }
        };
        if job.is_terminal() || (id != source && job.status.is_active()) {
            continue;
        }
        let explanation = if id == source {
            err.to_string()
        } else {
            format!("Previous task failed: {}", err)
        };
        let update = JobUpdate::status_with_explanation(JobStatus::Failed, explanation);
        match ctx.update(id, &update).await {
            Ok(_) => tracing::info!(job_id = %id, cause = %source, "failed by cascade"),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "cascade update failed"),
        }
    }
}

/// Records dispatched tasks without running them
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    tasks: Mutex<Vec<Task>>,
    finished: Mutex<HashSet<CorrelationId>>,
}

impl RecordingDispatcher {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks in dispatch order
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Job ids in dispatch order
    #[must_use]
    pub fn job_ids(&self) -> Vec<JobId> {
        self.tasks().into_iter().map(|t| t.job_id).collect()
    }

    /// Drop a task from the live set, as if its process exited
    pub fn finish(&self, correlation_id: CorrelationId) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.insert(correlation_id);
        }
    }
}

impl TaskDispatcher for RecordingDispatcher {
    fn dispatch(&self, task: Task) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }
}

impl ProcessRegistry for RecordingDispatcher {
    fn live(&self) -> HashSet<CorrelationId> {
        let finished = self.finished.lock().map(|f| f.clone()).unwrap_or_default();
        self.tasks()
            .into_iter()
            .map(|t| t.correlation_id)
            .filter(|id| !finished.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::World;
    use crate::settings::ExecutorSettings;
    use bastion_core::JobType;

    #[tokio::test]
    async fn test_failure_cascades_to_unstarted_jobs() {
        let world = World::new();
        world.job(1, JobType::Check, JobStatus::Failed, 5);
        world.job(2, JobType::Backup, JobStatus::Waiting, 0);
        world.job(3, JobType::Check, JobStatus::Running, 5);
        let err = TaskError::Failed {
            job: JobId::new(1),
            reason: "rc 2".into(),
        };
        on_failure(&world.ctx, &err, &[JobId::new(2), JobId::new(3)]).await;

        let jobs = world.store.jobs();
        assert_eq!(jobs[1].status, JobStatus::Failed);
        assert!(jobs[1].job_explanation.starts_with("Previous task failed"));
        assert_eq!(jobs[2].status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_local_dispatch_tracks_live_ids() {
        let world = World::new();
        world.job(1, JobType::Prune, JobStatus::Starting, 0);
        world.job(2, JobType::Backup, JobStatus::Waiting, 0);
        let runner = JobRunner::new(
            world.ctx.clone().with_builders(bastion_tool::BuilderRegistry::new()),
            ExecutorSettings::default(),
        );
        let dispatcher = LocalDispatcher::new(world.ctx.clone(), runner);
        let correlation_id = CorrelationId::new();
        dispatcher.dispatch(Task {
            job_id: JobId::new(1),
            correlation_id,
            fail_with: vec![JobId::new(2)],
        });
        assert!(dispatcher.live().contains(&correlation_id));

        dispatcher.wait_idle().await;
        assert!(dispatcher.live().is_empty());
        let jobs = world.store.jobs();
        // No builder for prune: setup error, and the bound job fails with it.
        assert_eq!(jobs[0].status, JobStatus::Error);
        assert_eq!(jobs[1].status, JobStatus::Failed);
    }

    #[test]
    fn test_recording_dispatcher_live_set() {
        let recorder = RecordingDispatcher::new();
        let first = CorrelationId::new();
        let second = CorrelationId::new();
        for (id, correlation_id) in [(1, first), (2, second)] {
            recorder.dispatch(Task {
                job_id: JobId::new(id),
                correlation_id,
                fail_with: Vec::new(),
            });
        }
        recorder.finish(first);
        assert_eq!(recorder.live(), HashSet::from([second]));
        assert_eq!(recorder.job_ids(), vec![JobId::new(1), JobId::new(2)]);
    }
}
