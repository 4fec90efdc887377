//! Job record and lifecycle state machine.
//!
//! Lattice: `new -> pending -> {waiting <-> pending} -> starting -> running ->
//! {successful, failed, error, canceled}`. Terminal statuses accept no
//! further transitions; re-applying the same terminal status is a no-op.
//!
//! Invariants maintained by [`Job::apply`]:
//! - `failed == status in {failed, error, canceled}`
//! - `finished` is set exactly once, on the first entry into a terminal status
//! - `elapsed` is derived once, together with `finished`

use crate::error::{CoreError, CoreResult};
use crate::id::{ClientId, CorrelationId, JobId, PolicyId, RepositoryId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Create an archive of a client
    Backup,
    /// Index the contents of a finished backup archive
    Catalog,
    /// Apply retention to a repository
    Prune,
    /// Extract an archive back onto a client
    Restore,
    /// Verify or prepare a repository, client or hypervisor
    Check,
}

impl JobType {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Catalog => "catalog",
            Self::Prune => "prune",
            Self::Restore => "restore",
            Self::Check => "check",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchType {
    /// Launched by a user
    Manual,
    /// Launched by a policy schedule
    Scheduled,
    /// Materialized by the scheduler ahead of another job
    Dependency,
    /// Relaunch of an earlier job
    Relaunch,
}

/// What a preparation (`check` + `dependency`) job makes ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrepareTarget {
    /// The borg repository
    Repository,
    /// The client host itself
    Client,
    /// The hypervisor host of a VM client
    Hypervisor,
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet admitted
    New,
    /// Admitted, awaiting a scheduler cycle
    Pending,
    /// Deferred by the scheduler
    Waiting,
    /// Dispatched to the executor, process not yet running
    Starting,
    /// External process running
    Running,
    /// Finished with exit code zero
    Successful,
    /// Process failed or could not be started
    Failed,
    /// Setup failed before the process was spawned
    Error,
    /// Canceled by request
    Canceled,
}

impl JobStatus {
    /// All statuses
    pub const ALL: [JobStatus; 9] = [
        Self::New,
        Self::Pending,
        Self::Waiting,
        Self::Starting,
        Self::Running,
        Self::Successful,
        Self::Failed,
        Self::Error,
        Self::Canceled,
    ];

    /// Statuses loaded by a scheduler cycle
    pub const SCHEDULABLE: [JobStatus; 3] = [Self::Pending, Self::Waiting, Self::Running];

    /// Statuses that hold a repository or client
    pub const ACTIVE: [JobStatus; 2] = [Self::Starting, Self::Running];

    /// No further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Error | Self::Canceled
        )
    }

    /// Terminal and counted as a failure
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Canceled)
    }

    /// Holding its repository/client
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Can still be canceled without a running process
    #[must_use]
    pub const fn is_cancelable_synchronously(self) -> bool {
        matches!(self, Self::New | Self::Pending | Self::Waiting)
    }

    /// Whether `self -> to` is an edge of the lifecycle lattice
    #[must_use]
    pub const fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            New => matches!(to, Pending | Waiting | Failed | Error | Canceled),
            Pending => matches!(
                to,
                Waiting | Starting | Running | Failed | Error | Canceled
            ),
            Waiting => matches!(
                to,
                Pending | Starting | Running | Failed | Error | Canceled
            ),
            Starting => matches!(to, Running | Failed | Error | Canceled),
            Running => to.is_terminal(),
            Successful | Failed | Error | Canceled => false,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch options captured with the job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Archive to restore; `"latest"` is resolved at start time
    #[serde(default)]
    pub archive: Option<String>,
    /// Paths to restore (empty = whole archive)
    #[serde(default)]
    pub paths: Vec<String>,
    /// Restore destination on the client
    #[serde(default)]
    pub destination: Option<String>,
}

impl JobOptions {
    /// Archive placeholder resolved by the pre-start check
    pub const LATEST_ARCHIVE: &'static str = "latest";

    /// Whether the archive still needs resolving
    #[must_use]
    pub fn has_deferred_archive(&self) -> bool {
        self.archive.as_deref() == Some(Self::LATEST_ARCHIVE)
    }
}

/// One schedulable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID
    pub id: JobId,
    /// Kind of work
    pub job_type: JobType,
    /// Lifecycle status
    pub status: JobStatus,
    /// Origin of the job
    pub launch_type: LaunchType,
    /// Policy the job was expanded from
    pub policy_id: Option<PolicyId>,
    /// Client the job acts on
    pub client_id: Option<ClientId>,
    /// Repository the job acts on
    pub repository_id: Option<RepositoryId>,
    /// Successor in the per-client chain
    pub dependent_jobs_id: Option<JobId>,
    /// Set on preparation jobs
    #[serde(default)]
    pub prepare: Option<PrepareTarget>,
    /// Cooperative cancellation request
    pub cancel_flag: bool,
    /// Derived from `status`
    pub failed: bool,
    /// Creation time (scheduler ordering key)
    pub created: Timestamp,
    /// Last persisted mutation
    pub modified: Timestamp,
    /// Entry into `running`
    pub started: Option<Timestamp>,
    /// First entry into a terminal status
    pub finished: Option<Timestamp>,
    /// Seconds between `started` and `finished`
    pub elapsed: Option<f64>,
    /// Correlation id of the external process handle
    pub celery_task_id: Option<CorrelationId>,
    /// Redacted command line
    #[serde(default)]
    pub job_args: Vec<String>,
    /// Working directory of the command
    #[serde(default)]
    pub job_cwd: Option<String>,
    /// Redacted process environment
    #[serde(default)]
    pub job_env: BTreeMap<String, String>,
    /// Human-readable diagnostics
    #[serde(default)]
    pub job_explanation: String,
    /// Error chain (verbose-debug only)
    #[serde(default)]
    pub result_traceback: String,
    /// Number of output events produced
    #[serde(default)]
    pub emitted_events: u64,
    /// Archive created by a backup job
    #[serde(default)]
    pub archive_name: Option<String>,
    /// Launch options
    #[serde(default)]
    pub options: JobOptions,
    /// Post-completion notification already sent
    #[serde(default)]
    pub completion_notified: bool,
}

impl Job {
    /// Create a new job in status `new`
    #[must_use]
    pub fn new(id: JobId, job_type: JobType, launch_type: LaunchType) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            job_type,
            status: JobStatus::New,
            launch_type,
            policy_id: None,
            client_id: None,
            repository_id: None,
            dependent_jobs_id: None,
            prepare: None,
            cancel_flag: false,
            failed: false,
            created: now,
            modified: now,
            started: None,
            finished: None,
            elapsed: None,
            celery_task_id: None,
            job_args: Vec::new(),
            job_cwd: None,
            job_env: BTreeMap::new(),
            job_explanation: String::new(),
            result_traceback: String::new(),
            emitted_events: 0,
            archive_name: None,
            options: JobOptions::default(),
            completion_notified: false,
        }
    }

    /// Set the policy
    #[must_use]
    pub fn with_policy(mut self, policy_id: PolicyId) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    /// Set the client
    #[must_use]
    pub fn with_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Set the repository
    #[must_use]
    pub fn with_repository(mut self, repository_id: RepositoryId) -> Self {
        self.repository_id = Some(repository_id);
        self
    }

    /// Set the initial (non-terminal) status
    #[must_use]
    pub fn with_status(mut self, status: JobStatus) -> Self {
        debug_assert!(!status.is_terminal());
        self.status = status;
        self
    }

    /// Set the creation time
    #[must_use]
    pub fn with_created(mut self, created: Timestamp) -> Self {
        self.created = created;
        self.modified = created;
        self
    }

    /// Mark as a preparation job
    #[must_use]
    pub fn with_prepare(mut self, target: PrepareTarget) -> Self {
        self.prepare = Some(target);
        self
    }

    /// Set launch options
    #[must_use]
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the chain successor
    #[must_use]
    pub fn with_dependent(mut self, dependent: JobId) -> Self {
        self.dependent_jobs_id = Some(dependent);
        self
    }

    /// Whether the job reached a terminal status
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a field-scoped update
    ///
    /// Returns whether the record changed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the status change is not a lattice edge.
    /// Nothing is modified in that case.
    pub fn apply(&mut self, update: &JobUpdate, now: Timestamp) -> CoreResult<bool> {
        if let Some(to) = update.status {
            if to != self.status && !self.status.can_transition_to(to) {
                return Err(CoreError::InvalidTransition {
                    from: self.status,
                    to,
                });
            }
        }

        let mut changed = false;

        if let Some(to) = update.status {
            if to != self.status {
                self.enter(to, now);
                changed = true;
            }
        }
        if let Some(flag) = update.cancel_flag {
            changed |= self.cancel_flag != flag;
            self.cancel_flag = flag;
        }
        if let Some(id) = update.celery_task_id {
            changed |= self.celery_task_id != Some(id);
            self.celery_task_id = Some(id);
        }
        if let Some(explanation) = &update.job_explanation {
            changed |= &self.job_explanation != explanation;
            self.job_explanation.clone_from(explanation);
        }
        if let Some(traceback) = &update.result_traceback {
            changed |= &self.result_traceback != traceback;
            self.result_traceback.clone_from(traceback);
        }
        if let Some(args) = &update.job_args {
            self.job_args.clone_from(args);
            changed = true;
        }
        if let Some(cwd) = &update.job_cwd {
            self.job_cwd = Some(cwd.clone());
            changed = true;
        }
        if let Some(env) = &update.job_env {
            self.job_env.clone_from(env);
            changed = true;
        }
        if let Some(count) = update.emitted_events {
            changed |= self.emitted_events != count;
            self.emitted_events = count;
        }
        if let Some(dependent) = update.dependent_jobs_id {
            changed |= self.dependent_jobs_id != Some(dependent);
            self.dependent_jobs_id = Some(dependent);
        }
        if let Some(name) = &update.archive_name {
            changed |= self.archive_name.as_ref() != Some(name);
            self.archive_name = Some(name.clone());
        }
        if let Some(options) = &update.options {
            changed |= &self.options != options;
            self.options = options.clone();
        }

        if changed {
            self.modified = now;
        }
        Ok(changed)
    }

    fn enter(&mut self, to: JobStatus, now: Timestamp) {
        self.status = to;
        self.failed = to.is_failure();
        if to == JobStatus::Running && self.started.is_none() {
            self.started = Some(now);
        }
        if to.is_terminal() && self.finished.is_none() {
            self.finished = Some(now);
            self.elapsed = Some(
                self.started
                    .map(|started| now.duration_since(&started).as_secs_f64())
                    .unwrap_or(0.0),
            );
        }
    }
}

/// Field-scoped mutation of a [`Job`]
///
/// Only the fields that are `Some` are written, so concurrent writers
/// (scheduler, executor, pipeline) do not clobber each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    /// New status
    pub status: Option<JobStatus>,
    /// Cancellation flag
    pub cancel_flag: Option<bool>,
    /// Correlation id
    pub celery_task_id: Option<CorrelationId>,
    /// Explanation
    pub job_explanation: Option<String>,
    /// Traceback
    pub result_traceback: Option<String>,
    /// Redacted argv
    pub job_args: Option<Vec<String>>,
    /// Working directory
    pub job_cwd: Option<String>,
    /// Redacted environment
    pub job_env: Option<BTreeMap<String, String>>,
    /// Event count
    pub emitted_events: Option<u64>,
    /// Chain successor
    pub dependent_jobs_id: Option<JobId>,
    /// Archive name
    pub archive_name: Option<String>,
    /// Resolved launch options
    pub options: Option<JobOptions>,
}

impl JobUpdate {
    /// Update that only changes the status
    #[must_use]
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Status change with an explanation
    #[must_use]
    pub fn status_with_explanation(status: JobStatus, explanation: impl Into<String>) -> Self {
        Self::status(status).with_explanation(explanation)
    }

    /// Set the explanation
    #[must_use]
    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.job_explanation = Some(explanation.into());
        self
    }

    /// Set the traceback
    #[must_use]
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.result_traceback = Some(traceback.into());
        self
    }

    /// Set the cancellation flag
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: bool) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    /// Set the correlation id
    #[must_use]
    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.celery_task_id = Some(id);
        self
    }

    /// Set the captured launch context
    #[must_use]
    pub fn with_launch_context(
        mut self,
        args: Vec<String>,
        cwd: String,
        env: BTreeMap<String, String>,
    ) -> Self {
        self.job_args = Some(args);
        self.job_cwd = Some(cwd);
        self.job_env = Some(env);
        self
    }

    /// Set the event count
    #[must_use]
    pub fn with_emitted_events(mut self, count: u64) -> Self {
        self.emitted_events = Some(count);
        self
    }

    /// Set the chain successor
    #[must_use]
    pub fn with_dependent(mut self, dependent: JobId) -> Self {
        self.dependent_jobs_id = Some(dependent);
        self
    }

    /// Set the archive name
    #[must_use]
    pub fn with_archive_name(mut self, name: impl Into<String>) -> Self {
        self.archive_name = Some(name.into());
        self
    }

    /// Set resolved options
    #[must_use]
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn make_job() -> Job {
        Job::new(JobId::new(1), JobType::Backup, LaunchType::Manual)
    }

    #[test]
    fn test_job_new() {
        let job = make_job();
        assert_eq!(job.status, JobStatus::New);
        assert!(!job.failed);
        assert!(job.finished.is_none());
    }

    #[test]
    fn test_full_lifecycle() {
        let mut job = make_job();
        let t0 = Timestamp::now();
        job.apply(&JobUpdate::status(JobStatus::Pending), t0).unwrap();
        job.apply(&JobUpdate::status(JobStatus::Starting), t0).unwrap();
        job.apply(&JobUpdate::status(JobStatus::Running), t0).unwrap();
        assert_eq!(job.started, Some(t0));

        let t1 = t0.advanced(Duration::from_secs(3));
        job.apply(&JobUpdate::status(JobStatus::Successful), t1).unwrap();
        assert_eq!(job.finished, Some(t1));
        assert_eq!(job.elapsed, Some(3.0));
        assert!(!job.failed);
    }

    #[test]
    fn test_failed_flag_tracks_status() {
        for status in [JobStatus::Failed, JobStatus::Error, JobStatus::Canceled] {
            let mut job = make_job().with_status(JobStatus::Pending);
            job.apply(&JobUpdate::status(status), Timestamp::now()).unwrap();
            assert!(job.failed);
        }
    }

    #[test]
    fn test_terminal_is_sticky() {
        let mut job = make_job().with_status(JobStatus::Running);
        let t0 = Timestamp::now();
        job.apply(&JobUpdate::status(JobStatus::Failed), t0).unwrap();

        let later = t0.advanced(Duration::from_secs(10));
        let changed = job.apply(&JobUpdate::status(JobStatus::Failed), later).unwrap();
        assert!(!changed);
        assert_eq!(job.finished, Some(t0));

        let err = job.apply(&JobUpdate::status(JobStatus::Successful), later);
        assert!(matches!(err, Err(CoreError::InvalidTransition { .. })));
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_invalid_transition_leaves_record_untouched() {
        let mut job = make_job();
        let update = JobUpdate::status(JobStatus::Running).with_explanation("nope");
        assert!(job.apply(&update, Timestamp::now()).is_err());
        assert_eq!(job.status, JobStatus::New);
        assert!(job.job_explanation.is_empty());
    }

    #[test]
    fn test_terminal_without_start_has_zero_elapsed() {
        let mut job = make_job();
        job.apply(&JobUpdate::status(JobStatus::Canceled), Timestamp::now())
            .unwrap();
        assert_eq!(job.elapsed, Some(0.0));
        assert!(job.started.is_none());
    }

    #[test]
    fn test_waiting_pending_round_trip() {
        let mut job = make_job().with_status(JobStatus::Pending);
        job.apply(&JobUpdate::status(JobStatus::Waiting), Timestamp::now())
            .unwrap();
        job.apply(&JobUpdate::status(JobStatus::Pending), Timestamp::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_deferred_archive() {
        let options = JobOptions {
            archive: Some("latest".to_string()),
            ..JobOptions::default()
        };
        assert!(options.has_deferred_archive());
        assert!(!JobOptions::default().has_deferred_archive());
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_invariants_hold_after_every_update(steps in prop::collection::vec(status_strategy(), 0..24)) {
            let mut job = make_job();
            let mut now = Timestamp::now();
            let mut first_finished = None;
            for to in steps {
                now = now.advanced(Duration::from_millis(5));
                let _ = job.apply(&JobUpdate::status(to), now);
                prop_assert_eq!(job.failed, job.status.is_failure());
                prop_assert_eq!(job.finished.is_some(), job.status.is_terminal());
                if let Some(finished) = job.finished {
                    let first = *first_finished.get_or_insert(finished);
                    prop_assert_eq!(first, finished);
                }
            }
        }
    }
}
