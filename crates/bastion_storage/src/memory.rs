//! In-memory job and event store.
//!
//! Used by tests across the workspace. Faults and latency can be injected
//! to exercise retry and escalation paths.

use crate::error::{StoreError, StoreResult};
use crate::store::{is_backup_of, is_prepare_for, EventStore, JobStore};
use async_trait::async_trait;
use bastion_core::{
    ClientId, Job, JobId, JobStatus, JobUpdate, PrepareTarget, RepositoryId, Timestamp,
};
use bastion_log::{CatalogEntry, Event};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Fault returned by the next matching store call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Fail with [`StoreError::Transient`]
    Transient,
    /// Fail with [`StoreError::Permanent`]
    Permanent,
}

impl StoreFault {
    fn into_error(self, op: &str) -> StoreError {
        match self {
            Self::Transient => StoreError::Transient(format!("{} unavailable", op)),
            Self::Permanent => StoreError::Permanent(format!("{} rejected", op)),
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    next_id: AtomicU64,
    events: Mutex<Vec<Event>>,
    catalog: Mutex<HashMap<JobId, Vec<CatalogEntry>>>,
    event_faults: Mutex<VecDeque<StoreFault>>,
    update_faults: Mutex<VecDeque<StoreFault>>,
    event_latency: Mutex<Duration>,
}

fn poisoned() -> StoreError {
    StoreError::Transient("memory store lock poisoned".to_string())
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every event insert by `latency`
    #[must_use]
    pub fn with_event_latency(self, latency: Duration) -> Self {
        if let Ok(mut current) = self.event_latency.lock() {
            *current = latency;
        }
        self
    }

    /// Queue faults for upcoming event and catalog inserts
    pub fn inject_event_faults(&self, faults: impl IntoIterator<Item = StoreFault>) {
        if let Ok(mut queue) = self.event_faults.lock() {
            queue.extend(faults);
        }
    }

    /// Queue faults for upcoming job updates
    pub fn inject_update_faults(&self, faults: impl IntoIterator<Item = StoreFault>) {
        if let Ok(mut queue) = self.update_faults.lock() {
            queue.extend(faults);
        }
    }

    /// Insert a job keeping its id
    pub fn insert_job(&self, job: Job) {
        self.next_id.fetch_max(job.id.as_u64(), Ordering::SeqCst);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job.id, job);
        }
    }

    /// All jobs, by id
    #[must_use]
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All events in persistence order
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Catalog entries persisted for a job
    #[must_use]
    pub fn catalog_entries(&self, job_id: JobId) -> Vec<CatalogEntry> {
        self.catalog
            .lock()
            .ok()
            .and_then(|c| c.get(&job_id).cloned())
            .unwrap_or_default()
    }

    fn take_fault(queue: &Mutex<VecDeque<StoreFault>>) -> Option<StoreFault> {
        queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn mutate<F>(&self, id: JobId, f: F) -> StoreResult<Job>
    where
        F: FnOnce(&mut Job) -> StoreResult<()>,
    {
        let mut jobs = self.jobs.lock().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        let mut draft = job.clone();
        f(&mut draft)?;
        *job = draft.clone();
        Ok(draft)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, mut job: Job) -> StoreResult<Job> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        job.id = JobId::new(id);
        let mut jobs = self.jobs.lock().map_err(|_| poisoned())?;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Job> {
        let jobs = self.jobs.lock().map_err(|_| poisoned())?;
        jobs.get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("job", id))
    }

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> StoreResult<Job> {
        if let Some(fault) = Self::take_fault(&self.update_faults) {
            return Err(fault.into_error("job update"));
        }
        self.mutate(id, |job| {
            job.apply(update, Timestamp::now())?;
            Ok(())
        })
    }

    async fn update_if_unmodified(
        &self,
        id: JobId,
        since: Timestamp,
        update: &JobUpdate,
    ) -> StoreResult<Option<Job>> {
        let mut jobs = self.jobs.lock().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        if job.modified > since {
            return Ok(None);
        }
        let mut draft = job.clone();
        draft.apply(update, Timestamp::now())?;
        *job = draft.clone();
        Ok(Some(draft))
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.lock().map_err(|_| poisoned())?;
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();
        found.sort_by_key(|j| (j.created, j.id));
        Ok(found)
    }

    async fn predecessors_of(&self, id: JobId) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.lock().map_err(|_| poisoned())?;
        Ok(jobs
            .values()
            .filter(|j| j.dependent_jobs_id == Some(id))
            .cloned()
            .collect())
    }

    async fn latest_prepare_job(
        &self,
        target: PrepareTarget,
        client_id: Option<ClientId>,
        repository_id: Option<RepositoryId>,
    ) -> StoreResult<Option<Job>> {
        let jobs = self.jobs.lock().map_err(|_| poisoned())?;
        Ok(jobs
            .values()
            .filter(|j| is_prepare_for(j, target, client_id, repository_id))
            .max_by_key(|j| (j.created, j.id))
            .cloned())
    }

    async fn latest_successful_backup(
        &self,
        client_id: Option<ClientId>,
        repository_id: Option<RepositoryId>,
    ) -> StoreResult<Option<Job>> {
        let jobs = self.jobs.lock().map_err(|_| poisoned())?;
        Ok(jobs
            .values()
            .filter(|j| is_backup_of(j, client_id, repository_id))
            .max_by_key(|j| (j.finished, j.id))
            .cloned())
    }

    async fn claim_completion_notice(&self, id: JobId) -> StoreResult<bool> {
        let mut jobs = self.jobs.lock().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        if job.completion_notified {
            return Ok(false);
        }
        job.completion_notified = true;
        Ok(true)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        let latency = self.event_latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(fault) = Self::take_fault(&self.event_faults) {
            return Err(fault.into_error("event insert"));
        }
        let mut events = self.events.lock().map_err(|_| poisoned())?;
        events.push(event.clone());
        Ok(())
    }

    async fn events_for_job(&self, job_id: JobId) -> StoreResult<Vec<Event>> {
        let events = self.events.lock().map_err(|_| poisoned())?;
        let mut found: Vec<Event> = events.iter().filter(|e| e.job_id == job_id).cloned().collect();
        found.sort_by_key(|e| e.counter);
        Ok(found)
    }

    async fn insert_catalog_entries(
        &self,
        job_id: JobId,
        entries: &[CatalogEntry],
    ) -> StoreResult<usize> {
        if let Some(fault) = Self::take_fault(&self.event_faults) {
            return Err(fault.into_error("catalog insert"));
        }
        let mut catalog = self.catalog.lock().map_err(|_| poisoned())?;
        catalog.entry(job_id).or_default().extend_from_slice(entries);
        Ok(entries.len())
    }
}
