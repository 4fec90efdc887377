//! Admission predicate.
//!
//! A job is blocked when:
//! - it was already scheduled in this cycle,
//! - a chain predecessor has not finished,
//! - another job on the same repository is starting or running,
//! - another job on the same client is starting or running,
//! - the concurrency cap (when configured) is reached.
//!
//! The state is rebuilt at the start of every cycle from the jobs that hold
//! resources, and updated in place as the cycle dispatches.

use bastion_core::{ClientId, Job, JobId, RepositoryId};
use std::collections::{HashMap, HashSet};

/// Why a job may not start in this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Dispatched earlier in this cycle
    AlreadyScheduled,
    /// Upstream chain job not finished
    Predecessor(JobId),
    /// Repository held by another job
    RepositoryBusy {
        /// Repository
        repository: RepositoryId,
        /// Holder
        holder: JobId,
    },
    /// Client held by another job
    ClientBusy {
        /// Client
        client: ClientId,
        /// Holder
        holder: JobId,
    },
    /// Concurrency cap reached
    Capacity(usize),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyScheduled => write!(f, "already scheduled in this cycle"),
            Self::Predecessor(id) => write!(f, "waiting for {} to finish", id),
            Self::RepositoryBusy { repository, holder } => {
                write!(f, "{} is in use by {}", repository, holder)
            }
            Self::ClientBusy { client, holder } => write!(f, "{} is in use by {}", client, holder),
            Self::Capacity(cap) => write!(f, "{} jobs already active", cap),
        }
    }
}

/// Resource holders for one scheduler cycle
#[derive(Debug, Clone, Default)]
pub struct Admission {
    repositories: HashMap<RepositoryId, JobId>,
    clients: HashMap<ClientId, JobId>,
    scheduled: HashSet<JobId>,
    active: usize,
    cap: Option<usize>,
}

impl Admission {
    /// Empty state with an optional concurrency cap
    #[must_use]
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    /// Build from the jobs of a cycle snapshot
    ///
    /// Only jobs in `starting`/`running` hold resources.
    #[must_use]
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>, cap: Option<usize>) -> Self {
        let mut admission = Self::new(cap);
        for job in jobs.into_iter().filter(|j| j.status.is_active()) {
            admission.hold(job);
        }
        admission
    }

    fn hold(&mut self, job: &Job) {
        if let Some(repository) = job.repository_id {
            self.repositories.entry(repository).or_insert(job.id);
        }
        if let Some(client) = job.client_id {
            self.clients.entry(client).or_insert(job.id);
        }
        self.active += 1;
    }

    /// Evaluate the predicate
    ///
    /// `predecessors` are the jobs whose `dependent_jobs_id` points at `job`.
    #[must_use]
    pub fn blocked(&self, job: &Job, predecessors: &[Job]) -> Option<BlockReason> {
        if self.scheduled.contains(&job.id) {
            return Some(BlockReason::AlreadyScheduled);
        }
        if let Some(upstream) = predecessors.iter().find(|p| !p.is_terminal()) {
            return Some(BlockReason::Predecessor(upstream.id));
        }
        if let Some(repository) = job.repository_id {
            if let Some(holder) = self.repositories.get(&repository).filter(|h| **h != job.id) {
                return Some(BlockReason::RepositoryBusy {
                    repository,
                    holder: *holder,
                });
            }
        }
        if let Some(client) = job.client_id {
            if let Some(holder) = self.clients.get(&client).filter(|h| **h != job.id) {
                return Some(BlockReason::ClientBusy {
                    client,
                    holder: *holder,
                });
            }
        }
        match self.cap {
            Some(cap) if self.active >= cap => Some(BlockReason::Capacity(cap)),
            _ => None,
        }
    }

    /// Record that `job` was dispatched in this cycle
    pub fn claim(&mut self, job: &Job) {
        if self.scheduled.insert(job.id) {
            self.hold(job);
        }
    }

    /// Whether `job` was dispatched in this cycle
    #[must_use]
    pub fn is_scheduled(&self, job: JobId) -> bool {
        self.scheduled.contains(&job)
    }

    /// Jobs holding resources, including those claimed this cycle
    #[must_use]
    pub fn active(&self) -> usize {
        self.active
    }
}
