//! Shared runtime context.
//!
//! Built once at startup and cloned into the scheduler, the dispatcher and
//! every job runner. Dropping the last clone releases the stores and the
//! event sink; nothing needs explicit teardown.

use bastion_core::{Job, JobId, JobUpdate, Notification, Notifier};
use bastion_log::EventSink;
use bastion_storage::{update_with_retry, ConfigSource, JobStore, RetryPolicy, StoreResult};
use bastion_tool::{BuilderRegistry, ToolSettings, TunnelPorts};
use std::sync::Arc;
use tokio::sync::Notify;

/// Collaborators shared by the scheduler and the executor
#[derive(Clone)]
pub struct Context {
    /// Job records
    pub jobs: Arc<dyn JobStore>,
    /// Policies, clients and repositories
    pub config: Arc<dyn ConfigSource>,
    /// Pub/sub notifications
    pub notifier: Arc<dyn Notifier>,
    /// Producer side of the event queue
    pub sink: Arc<dyn EventSink>,
    /// Command builders
    pub builders: Arc<BuilderRegistry>,
    /// Program names and callback settings
    pub tool: Arc<ToolSettings>,
    /// Retry policy for job updates
    pub retry: RetryPolicy,
    /// Remote ports for pull-mode tunnels
    pub tunnels: TunnelPorts,
    wake: Arc<Notify>,
}

impl Context {
    /// Create a context
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        config: Arc<dyn ConfigSource>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            jobs,
            config,
            notifier,
            sink,
            builders: Arc::new(BuilderRegistry::with_defaults()),
            tool: Arc::new(ToolSettings::default()),
            retry: RetryPolicy::default(),
            tunnels: TunnelPorts::default(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Use a different builder registry
    #[must_use]
    pub fn with_builders(mut self, builders: BuilderRegistry) -> Self {
        self.builders = Arc::new(builders);
        self
    }

    /// Use different tool settings
    #[must_use]
    pub fn with_tool_settings(mut self, tool: ToolSettings) -> Self {
        self.tool = Arc::new(tool);
        self
    }

    /// Use a different tunnel port pool
    #[must_use]
    pub fn with_tunnel_ports(mut self, tunnels: TunnelPorts) -> Self {
        self.tunnels = tunnels;
        self
    }

    /// Use a different retry policy for job updates
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Apply a field-scoped update with retries
    ///
    /// Publishes a status notification when the status changed.
    ///
    /// # Errors
    ///
    /// Returns the last storage error
    pub async fn update(&self, id: JobId, update: &JobUpdate) -> StoreResult<Job> {
        let job = update_with_retry(self.jobs.as_ref(), self.retry, id, update).await?;
        if update.status.is_some() {
            self.notify_status(&job);
        }
        Ok(job)
    }

    /// Publish the current status of `job`
    pub fn notify_status(&self, job: &Job) {
        self.notifier.publish(Notification::status_changed(job));
    }

    /// Ask the scheduler for a cycle soon
    pub fn wake_scheduler(&self) {
        self.wake.notify_one();
    }

    /// Wait for a wake-up request
    pub async fn woken(&self) {
        self.wake.notified().await;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("builders", &self.builders)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! A small inventory shared by the runtime tests.

    use super::*;
    use bastion_core::{
        BackupMode, Client, ClientId, Credentials, JobStatus, JobType, LaunchType, MemoryNotifier,
        Policy, PolicyId, PolicyType, PrepareTarget, Repository, RepositoryId, Retention,
        Timestamp,
    };
    use bastion_log::MemoryQueue;
    use bastion_storage::{MemoryConfig, MemoryStore};
    use std::time::Duration;

    pub struct World {
        pub store: Arc<MemoryStore>,
        pub config: Arc<MemoryConfig>,
        pub notifier: Arc<MemoryNotifier>,
        pub queue: Arc<MemoryQueue>,
        pub ctx: Context,
    }

    pub fn client(id: u64) -> Client {
        Client {
            id: ClientId::new(id),
            hostname: format!("host{}", id),
            port: 22,
            username: "root".into(),
            enabled: true,
            ready: true,
            hypervisor_id: None,
            remote_dir: "/tmp/.bastion".into(),
            credentials: Credentials::default(),
        }
    }

    pub fn repository(id: u64) -> Repository {
        Repository {
            id: RepositoryId::new(id),
            name: format!("repo{}", id),
            url: format!("/srv/borg/repo{}", id),
            ready: true,
            credentials: Credentials::default(),
        }
    }

    pub fn policy(id: u64, repository: u64, clients: &[u64]) -> Policy {
        Policy {
            id: PolicyId::new(id),
            name: format!("policy{}", id),
            policy_type: PolicyType::Filesystem,
            enabled: true,
            repository_id: RepositoryId::new(repository),
            client_ids: clients.iter().copied().map(ClientId::new).collect(),
            retention: Retention {
                keep_daily: Some(7),
                ..Retention::default()
            },
            catalog_enabled: true,
            auto_prune: true,
            mode: BackupMode::Push,
            paths: vec!["/etc".into()],
            excludes: Vec::new(),
            compression: "lz4".into(),
            dump_command: None,
            timeout_secs: None,
        }
    }

    impl World {
        pub fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let config = Arc::new(MemoryConfig::from_inventory(
                vec![policy(1, 1, &[1, 2])],
                vec![client(1), client(2)],
                vec![repository(1)],
            ));
            let notifier = Arc::new(MemoryNotifier::new());
            let queue = Arc::new(MemoryQueue::new());
            let ctx = Context::new(
                store.clone(),
                config.clone(),
                notifier.clone(),
                queue.clone(),
            )
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)));
            Self {
                store,
                config,
                notifier,
                queue,
                ctx,
            }
        }

        /// Insert a job with a fixed id, status and age
        pub fn job(&self, id: u64, job_type: JobType, status: JobStatus, age_secs: u64) -> Job {
            let job = Job::new(JobId::new(id), job_type, LaunchType::Manual)
                .with_policy(PolicyId::new(1))
                .with_client(ClientId::new(1))
                .with_repository(RepositoryId::new(1))
                .with_created(Timestamp::now().backdated(Duration::from_secs(age_secs)));
            let job = Job { status, ..job };
            self.store.insert_job(job.clone());
            job
        }

        /// Record successful preparation of the repository and clients
        pub fn prepared(&self, first_id: u64) {
            let mut id = first_id;
            let mut done = |target: PrepareTarget, client: Option<u64>, repo: Option<u64>| {
                let mut job = Job::new(JobId::new(id), JobType::Check, LaunchType::Dependency)
                    .with_prepare(target)
                    .with_created(Timestamp::now().backdated(Duration::from_secs(600)));
                job.client_id = client.map(ClientId::new);
                job.repository_id = repo.map(RepositoryId::new);
                job.status = JobStatus::Successful;
                job.finished = Some(Timestamp::now());
                self.store.insert_job(job);
                id += 1;
            };
            done(PrepareTarget::Repository, None, Some(1));
            done(PrepareTarget::Client, Some(1), None);
            done(PrepareTarget::Client, Some(2), None);
        }
    }
}
