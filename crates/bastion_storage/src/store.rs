//! Storage traits.
//!
//! Every job mutation goes through [`JobStore::update_job`] with a
//! field-scoped [`JobUpdate`]; the store applies it under its own lock so
//! the scheduler, executor and pipeline never overwrite each other's
//! fields.

use crate::config::ReadyTarget;
use crate::error::StoreResult;
use async_trait::async_trait;
use bastion_core::{
    Client, ClientId, Job, JobId, JobStatus, JobUpdate, Policy, PolicyId, PrepareTarget,
    Repository, RepositoryId, Timestamp,
};
use bastion_log::{CatalogEntry, Event};

/// Job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job, assigning its id
    ///
    /// The id carried by `job` is ignored.
    async fn create_job(&self, job: Job) -> StoreResult<Job>;

    /// Load one job
    async fn get_job(&self, id: JobId) -> StoreResult<Job>;

    /// Apply a field-scoped update and return the new record
    async fn update_job(&self, id: JobId, update: &JobUpdate) -> StoreResult<Job>;

    /// Apply `update` only if the job was not modified after `since`
    ///
    /// Returns `None` when the record changed in between.
    async fn update_if_unmodified(
        &self,
        id: JobId,
        since: Timestamp,
        update: &JobUpdate,
    ) -> StoreResult<Option<Job>>;

    /// Jobs in any of `statuses`, oldest `created` first
    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>>;

    /// Jobs whose `dependent_jobs_id` points at `id`
    async fn predecessors_of(&self, id: JobId) -> StoreResult<Vec<Job>>;

    /// Most recently created preparation job for a subject
    async fn latest_prepare_job(
        &self,
        target: PrepareTarget,
        client_id: Option<ClientId>,
        repository_id: Option<RepositoryId>,
    ) -> StoreResult<Option<Job>>;

    /// Most recent successful backup with an archive name
    async fn latest_successful_backup(
        &self,
        client_id: Option<ClientId>,
        repository_id: Option<RepositoryId>,
    ) -> StoreResult<Option<Job>>;

    /// Mark the post-completion notice as sent
    ///
    /// Returns `true` for the first caller only.
    async fn claim_completion_notice(&self, id: JobId) -> StoreResult<bool>;
}

/// Output events and catalog entries
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist one event
    async fn insert_event(&self, event: &Event) -> StoreResult<()>;

    /// Events of a job, ordered by counter
    async fn events_for_job(&self, job_id: JobId) -> StoreResult<Vec<Event>>;

    /// Persist catalog entries produced by a job
    async fn insert_catalog_entries(
        &self,
        job_id: JobId,
        entries: &[CatalogEntry],
    ) -> StoreResult<usize>;
}

/// Read-only configuration, plus readiness marking
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load a policy
    async fn policy(&self, id: PolicyId) -> StoreResult<Policy>;

    /// Load a client
    async fn client(&self, id: ClientId) -> StoreResult<Client>;

    /// Load a repository
    async fn repository(&self, id: RepositoryId) -> StoreResult<Repository>;

    /// Record that a preparation job succeeded
    async fn mark_ready(&self, target: ReadyTarget) -> StoreResult<()>;
}

/// Shared predicate for [`JobStore::latest_prepare_job`]
#[must_use]
pub fn is_prepare_for(
    job: &Job,
    target: PrepareTarget,
    client_id: Option<ClientId>,
    repository_id: Option<RepositoryId>,
) -> bool {
    job.prepare == Some(target) && job.client_id == client_id && job.repository_id == repository_id
}

/// Shared predicate for [`JobStore::latest_successful_backup`]
#[must_use]
pub fn is_backup_of(
    job: &Job,
    client_id: Option<ClientId>,
    repository_id: Option<RepositoryId>,
) -> bool {
    job.job_type == bastion_core::JobType::Backup
        && job.status == JobStatus::Successful
        && job.archive_name.is_some()
        && (client_id.is_none() || job.client_id == client_id)
        && (repository_id.is_none() || job.repository_id == repository_id)
}
