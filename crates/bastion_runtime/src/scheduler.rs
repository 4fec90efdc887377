//! Scheduler cycle.
//!
//! One cycle, under the advisory lock:
//! 1. reconcile the job table with live processes (throttled)
//! 2. load pending, waiting, starting and running jobs, oldest first
//! 3. promote waiting jobs the admission predicate no longer blocks
//! 4. for each pending job, materialize its preparation jobs, then start it
//!    or defer it to `waiting`
//!
//! Tasks are handed to the dispatcher only after the whole cycle has
//! written its updates, so a runner never sees a half-scheduled job.

use crate::admission::{Admission, BlockReason};
use crate::context::Context;
use crate::dependency;
use crate::dispatch::{self, ProcessRegistry, Task, TaskDispatcher};
use crate::error::RuntimeResult;
use crate::outcome::TaskError;
use crate::reconcile::Reconciler;
use crate::settings::SchedulerSettings;
use bastion_core::{
    CorrelationId, Job, JobId, JobOptions, JobStatus, JobType, JobUpdate, LaunchType,
};
use bastion_storage::AdvisoryLock;
use std::sync::{Arc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Statuses loaded by a cycle
const SNAPSHOT: [JobStatus; 4] = [
    JobStatus::Pending,
    JobStatus::Waiting,
    JobStatus::Starting,
    JobStatus::Running,
];

/// What a cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Another cycle held the lock
    pub skipped: bool,
    /// Jobs failed by reconciliation
    pub reconciled: Vec<JobId>,
    /// Jobs promoted from `waiting` to `pending`
    pub unblocked: Vec<JobId>,
    /// Preparation jobs created
    pub created: Vec<JobId>,
    /// Jobs handed to the dispatcher, in order
    pub dispatched: Vec<JobId>,
    /// Jobs deferred to `waiting`
    pub deferred: Vec<JobId>,
    /// Jobs failed by the pre-start check
    pub failed: Vec<JobId>,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether the cycle changed nothing
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.reconciled.is_empty()
            && self.unblocked.is_empty()
            && self.created.is_empty()
            && self.dispatched.is_empty()
            && self.failed.is_empty()
    }
}

/// State of one cycle
struct Cycle {
    admission: Admission,
    tasks: Vec<Task>,
    report: CycleReport,
}

/// Admission controller
pub struct Scheduler {
    ctx: Context,
    settings: SchedulerSettings,
    lock: Arc<dyn AdvisoryLock>,
    dispatcher: Arc<dyn TaskDispatcher>,
    reconciler: Reconciler,
    last_reconcile: Mutex<Option<Instant>>,
}

impl Scheduler {
    /// Create a scheduler
    #[must_use]
    pub fn new(
        ctx: Context,
        settings: SchedulerSettings,
        lock: Arc<dyn AdvisoryLock>,
        dispatcher: Arc<dyn TaskDispatcher>,
        registry: Arc<dyn ProcessRegistry>,
    ) -> Self {
        let reconciler = Reconciler::new(ctx.clone(), registry);
        Self {
            ctx,
            settings,
            lock,
            dispatcher,
            reconciler,
            last_reconcile: Mutex::new(None),
        }
    }

    /// Run cycles until `shutdown` fires
    ///
    /// A cycle runs every `cycle_interval` and whenever the context is
    /// woken by a launch or a finished task.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.settings.cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.settings.cycle_interval(), "scheduler started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.ctx.woken() => {}
            }
            match self.schedule().await {
                Ok(report) if report.skipped => tracing::debug!("cycle skipped, lock held elsewhere"),
                Ok(report) if !report.is_idle() => tracing::info!(
                    dispatched = report.dispatched.len(),
                    deferred = report.deferred.len(),
                    created = report.created.len(),
                    failed = report.failed.len(),
                    reconciled = report.reconciled.len(),
                    "cycle finished"
                ),
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "scheduler cycle failed"),
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Run one cycle
    ///
    /// # Errors
    ///
    /// Returns error if the lock or the job snapshot cannot be obtained
    pub async fn schedule(&self) -> RuntimeResult<CycleReport> {
        let Some(_guard) = self.lock.try_lock()? else {
            return Ok(CycleReport::skipped());
        };

        let mut report = CycleReport::default();
        if self.reconcile_due() {
            report.reconciled = self.reconciler.reconcile().await?;
        }

        let jobs = self.ctx.jobs.jobs_with_status(&SNAPSHOT).await?;
        let mut cycle = Cycle {
            admission: Admission::from_jobs(&jobs, self.settings.max_concurrent_jobs),
            tasks: Vec::new(),
            report,
        };

        let mut queue = Vec::new();
        for job in jobs {
            match job.status {
                JobStatus::Pending => queue.push(job),
                JobStatus::Waiting => {
                    if let Some(job) = self.unblock(job, &mut cycle).await {
                        queue.push(job);
                    }
                }
                _ => {}
            }
        }

        for job in queue {
            if cycle.admission.is_scheduled(job.id) {
                continue;
            }
            if let Err(err) = self.process(job.clone(), &mut cycle).await {
                tracing::warn!(job_id = %job.id, error = %err, "job skipped this cycle");
            }
        }

        for task in cycle.tasks.drain(..) {
            cycle.report.dispatched.push(task.job_id);
            self.dispatcher.dispatch(task);
        }
        Ok(cycle.report)
    }

    fn reconcile_due(&self) -> bool {
        let Ok(mut last) = self.last_reconcile.lock() else {
            return false;
        };
        let due = last.is_none_or(|at| at.elapsed() >= self.settings.reconcile_interval());
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    async fn unblock(&self, job: Job, cycle: &mut Cycle) -> Option<Job> {
        let predecessors = match self.ctx.jobs.predecessors_of(job.id).await {
            Ok(predecessors) => predecessors,
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "cannot load predecessors");
                return None;
            }
        };
        if cycle.admission.blocked(&job, &predecessors).is_some() {
            return None;
        }
        match self.ctx.update(job.id, &JobUpdate::status(JobStatus::Pending)).await {
            Ok(job) => {
                cycle.report.unblocked.push(job.id);
                Some(job)
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "cannot unblock job");
                None
            }
        }
    }

    async fn process(&self, job: Job, cycle: &mut Cycle) -> RuntimeResult<()> {
        let deps = match dependency::materialize(&self.ctx, &self.settings, &job).await {
            Ok(deps) => deps,
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                let reason = format!("Preparation jobs could not be created: {}", err);
                return self.fail_before_start(&job, reason, cycle).await;
            }
        };
        for prep in &deps.created {
            cycle.report.created.push(prep.id);
            match cycle.admission.blocked(prep, &[]) {
                None => self.start_task(prep, cycle).await?,
                Some(reason) => self.defer(prep, &reason, cycle).await?,
            }
        }
        // A preparation job that failed its pre-start check took the trigger down.
        if deps.created.iter().any(|p| cycle.report.failed.contains(&p.id))
            && self.ctx.jobs.get_job(job.id).await?.is_terminal()
        {
            return Ok(());
        }

        let reason = match deps.blocker() {
            Some(prep) => Some(BlockReason::Predecessor(prep)),
            None => {
                let predecessors = self.ctx.jobs.predecessors_of(job.id).await?;
                cycle.admission.blocked(&job, &predecessors)
            }
        };
        match reason {
            None => self.start_task(&job, cycle).await,
            Some(reason) => self.defer(&job, &reason, cycle).await,
        }
    }

    async fn defer(&self, job: &Job, reason: &BlockReason, cycle: &mut Cycle) -> RuntimeResult<()> {
        tracing::debug!(job_id = %job.id, %reason, "job deferred");
        if job.status != JobStatus::Waiting {
            self.ctx
                .update(job.id, &JobUpdate::status(JobStatus::Waiting))
                .await?;
        }
        cycle.report.deferred.push(job.id);
        Ok(())
    }

    /// Move `job` to `starting`, check it, and queue it for dispatch
    async fn start_task(&self, job: &Job, cycle: &mut Cycle) -> RuntimeResult<()> {
        let job = self
            .ctx
            .update(job.id, &JobUpdate::status(JobStatus::Starting))
            .await?;
        let options = match self.pre_start(&job).await {
            Ok(options) => options,
            Err(reason) => return self.fail_before_start(&job, reason, cycle).await,
        };

        let correlation_id = CorrelationId::new();
        let mut update = JobUpdate::default().with_correlation(correlation_id);
        if let Some(options) = options {
            update = update.with_options(options);
        }
        self.ctx.update(job.id, &update).await?;
        cycle.admission.claim(&job);

        let fail_with = self.bound_failures(&job).await?;
        tracing::info!(job_id = %job.id, job_type = %job.job_type, %correlation_id, "job admitted");
        cycle.tasks.push(Task {
            job_id: job.id,
            correlation_id,
            fail_with,
        });
        Ok(())
    }

    /// Validate that `job` can start and resolve deferred launch options
    async fn pre_start(&self, job: &Job) -> Result<Option<JobOptions>, String> {
        let config = &self.ctx.config;
        if let Some(id) = job.policy_id {
            let policy = config.policy(id).await.map_err(|e| e.to_string())?;
            if !policy.enabled {
                return Err(format!("{} is disabled", id));
            }
        }
        if let Some(id) = job.client_id {
            let client = config.client(id).await.map_err(|e| e.to_string())?;
            if !client.enabled {
                return Err(format!("{} is disabled", id));
            }
        }
        if let Some(id) = job.repository_id {
            config.repository(id).await.map_err(|e| e.to_string())?;
        }

        if job.job_type == JobType::Restore && job.options.has_deferred_archive() {
            let backup = self
                .ctx
                .jobs
                .latest_successful_backup(job.client_id, job.repository_id)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "no successful backup to restore from".to_string())?;
            let mut options = job.options.clone();
            options.archive = backup.archive_name;
            tracing::debug!(job_id = %job.id, archive = ?options.archive, "resolved latest archive");
            return Ok(Some(options));
        }
        Ok(None)
    }

    async fn fail_before_start(&self, job: &Job, reason: String, cycle: &mut Cycle) -> RuntimeResult<()> {
        tracing::warn!(job_id = %job.id, %reason, "job cannot start");
        let explanation = format!("Job cannot start: {}", reason);
        self.ctx
            .update(job.id, &JobUpdate::status_with_explanation(JobStatus::Failed, explanation))
            .await?;
        cycle.report.failed.push(job.id);

        let fail_with = self.bound_failures(job).await?;
        if !fail_with.is_empty() {
            let err = TaskError::Failed { job: job.id, reason };
            dispatch::on_failure(&self.ctx, &err, &fail_with).await;
        }
        Ok(())
    }

    /// Jobs that must fail if `job` fails
    ///
    /// A preparation job takes down the job it was created for and the
    /// other unfinished preparation jobs of that job.
    async fn bound_failures(&self, job: &Job) -> RuntimeResult<Vec<JobId>> {
        let Some(trigger) = job
            .dependent_jobs_id
            .filter(|_| job.launch_type == LaunchType::Dependency)
        else {
            return Ok(Vec::new());
        };
        let siblings = self.ctx.jobs.predecessors_of(trigger).await?;
        Ok(std::iter::once(trigger)
            .chain(
                siblings
                    .iter()
                    .filter(|s| s.id != job.id && s.launch_type == LaunchType::Dependency)
                    .filter(|s| !s.is_terminal())
                    .map(|s| s.id),
            )
            .collect())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
