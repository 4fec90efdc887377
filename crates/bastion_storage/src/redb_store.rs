//! Persistent store on a single redb file.
//!
//! Records are stored as JSON values. Events are keyed by `(job_id,
//! counter)` so reading a job's stream is a range scan in counter order.
//! Two multimap indexes answer the scheduler's per-cycle lookups without a
//! table scan: successor id to predecessor ids, and preparation subject to
//! job ids. They are maintained in the same transaction as the job write.
//! redb calls are blocking and run on the tokio blocking pool.
//!
//! redb holds an exclusive lock on the file, so one process owns the store;
//! others reach it through that process.

use crate::error::{StoreError, StoreResult};
use crate::store::{is_backup_of, is_prepare_for, EventStore, JobStore};
use async_trait::async_trait;
use bastion_core::{
    ClientId, Job, JobId, JobStatus, JobUpdate, PrepareTarget, RepositoryId, Timestamp,
};
use bastion_log::{CatalogEntry, Event};
use redb::{
    Database, MultimapTableDefinition, ReadTransaction, ReadableMultimapTable, ReadableTable,
    TableDefinition, WriteTransaction,
};
use std::path::Path;
use std::sync::Arc;

const JOBS: TableDefinition<u64, &str> = TableDefinition::new("jobs");
const EVENTS: TableDefinition<(u64, u64), &str> = TableDefinition::new("events");
const CATALOG: TableDefinition<(u64, u64), &str> = TableDefinition::new("catalog");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const PREDECESSORS: MultimapTableDefinition<u64, u64> = MultimapTableDefinition::new("predecessors");
const PREPARES: MultimapTableDefinition<&str, u64> = MultimapTableDefinition::new("prepares");

const NEXT_JOB_ID: &str = "next_job_id";
const INDEX_VERSION: &str = "index_version";
const CURRENT_INDEX_VERSION: u64 = 1;

fn prepare_key(
    target: PrepareTarget,
    client_id: Option<ClientId>,
    repository_id: Option<RepositoryId>,
) -> String {
    let part = |id: Option<u64>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
    format!(
        "{:?}/{}/{}",
        target,
        part(client_id.map(|c| c.as_u64())),
        part(repository_id.map(|r| r.as_u64()))
    )
}

fn prepare_key_of(job: &Job) -> Option<String> {
    job.prepare
        .map(|target| prepare_key(target, job.client_id, job.repository_id))
}

fn db_err(err: impl Into<redb::Error>) -> StoreError {
    StoreError::from(err.into())
}

/// redb-backed job and event store
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create the database file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or initialized
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;
        let txn = db.begin_write().map_err(db_err)?;
        {
            txn.open_table(JOBS).map_err(db_err)?;
            txn.open_table(EVENTS).map_err(db_err)?;
            txn.open_table(CATALOG).map_err(db_err)?;
            txn.open_table(META).map_err(db_err)?;
            txn.open_multimap_table(PREDECESSORS).map_err(db_err)?;
            txn.open_multimap_table(PREPARES).map_err(db_err)?;
        }
        let version = txn
            .open_table(META)
            .map_err(db_err)?
            .get(INDEX_VERSION)
            .map_err(db_err)?
            .map(|v| v.value())
            .unwrap_or(0);
        if version < CURRENT_INDEX_VERSION {
            let indexed = Self::rebuild_indexes(&txn)?;
            tracing::info!(jobs = indexed, "rebuilt job indexes");
        }
        txn.commit().map_err(db_err)?;
        tracing::info!(path = %path.as_ref().display(), "opened job store");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|err| StoreError::Transient(format!("storage task failed: {}", err)))?
    }

    fn scan_jobs<P>(db: &Database, mut keep: P) -> StoreResult<Vec<Job>>
    where
        P: FnMut(&Job) -> bool,
    {
        let txn = db.begin_read().map_err(db_err)?;
        let table = txn.open_table(JOBS).map_err(db_err)?;
        let mut found = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (_, value) = item.map_err(db_err)?;
            let job: Job = serde_json::from_str(value.value())?;
            if keep(&job) {
                found.push(job);
            }
        }
        Ok(found)
    }

    fn rebuild_indexes(txn: &WriteTransaction) -> StoreResult<usize> {
        txn.delete_multimap_table(PREDECESSORS).map_err(db_err)?;
        txn.delete_multimap_table(PREPARES).map_err(db_err)?;
        let jobs: Vec<Job> = {
            let table = txn.open_table(JOBS).map_err(db_err)?;
            let mut jobs = Vec::new();
            for item in table.iter().map_err(db_err)? {
                let (_, value) = item.map_err(db_err)?;
                jobs.push(serde_json::from_str(value.value())?);
            }
            jobs
        };
        for job in &jobs {
            Self::reindex(txn, None, job)?;
        }
        txn.open_table(META)
            .map_err(db_err)?
            .insert(INDEX_VERSION, CURRENT_INDEX_VERSION)
            .map_err(db_err)?;
        Ok(jobs.len())
    }

    fn reindex(txn: &WriteTransaction, before: Option<&Job>, after: &Job) -> StoreResult<()> {
        let id = after.id.as_u64();
        let old_successor = before.and_then(|j| j.dependent_jobs_id);
        if old_successor != after.dependent_jobs_id {
            let mut index = txn.open_multimap_table(PREDECESSORS).map_err(db_err)?;
            if let Some(successor) = old_successor {
                index.remove(successor.as_u64(), id).map_err(db_err)?;
            }
            if let Some(successor) = after.dependent_jobs_id {
                index.insert(successor.as_u64(), id).map_err(db_err)?;
            }
        }
        let old_key = before.and_then(prepare_key_of);
        let new_key = prepare_key_of(after);
        if old_key != new_key {
            let mut index = txn.open_multimap_table(PREPARES).map_err(db_err)?;
            if let Some(key) = &old_key {
                index.remove(key.as_str(), id).map_err(db_err)?;
            }
            if let Some(key) = &new_key {
                index.insert(key.as_str(), id).map_err(db_err)?;
            }
        }
        Ok(())
    }

    fn load_jobs(txn: &ReadTransaction, ids: &[u64]) -> StoreResult<Vec<Job>> {
        let table = txn.open_table(JOBS).map_err(db_err)?;
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = table.get(*id).map_err(db_err)? {
                found.push(serde_json::from_str(value.value())?);
            }
        }
        Ok(found)
    }

    fn modify_job<F>(db: &Database, id: JobId, f: F) -> StoreResult<Option<Job>>
    where
        F: FnOnce(&mut Job) -> StoreResult<bool>,
    {
        let txn = db.begin_write().map_err(db_err)?;
        let updated = {
            let mut table = txn.open_table(JOBS).map_err(db_err)?;
            let mut job: Job = {
                let value = table
                    .get(id.as_u64())
                    .map_err(db_err)?
                    .ok_or_else(|| StoreError::not_found("job", id))?;
                serde_json::from_str(value.value())?
            };
            let before = job.clone();
            if f(&mut job)? {
                let json = serde_json::to_string(&job)?;
                table.insert(id.as_u64(), json.as_str()).map_err(db_err)?;
                Some((before, job))
            } else {
                None
            }
        };
        if let Some((before, after)) = &updated {
            Self::reindex(&txn, Some(before), after)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(updated.map(|(_, job)| job))
    }

    fn next_id(txn: &WriteTransaction) -> StoreResult<u64> {
        let mut meta = txn.open_table(META).map_err(db_err)?;
        let current = meta
            .get(NEXT_JOB_ID)
            .map_err(db_err)?
            .map(|v| v.value())
            .unwrap_or(0);
        let next = current + 1;
        meta.insert(NEXT_JOB_ID, next).map_err(db_err)?;
        Ok(next)
    }
}

#[async_trait]
impl JobStore for RedbStore {
    async fn create_job(&self, mut job: Job) -> StoreResult<Job> {
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            job.id = JobId::new(Self::next_id(&txn)?);
            {
                let mut table = txn.open_table(JOBS).map_err(db_err)?;
                let json = serde_json::to_string(&job)?;
                table.insert(job.id.as_u64(), json.as_str()).map_err(db_err)?;
            }
            Self::reindex(&txn, None, &job)?;
            txn.commit().map_err(db_err)?;
            Ok(job)
        })
        .await
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Job> {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(JOBS).map_err(db_err)?;
            let value = table
                .get(id.as_u64())
                .map_err(db_err)?
                .ok_or_else(|| StoreError::not_found("job", id))?;
            Ok(serde_json::from_str(value.value())?)
        })
        .await
    }

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> StoreResult<Job> {
        let update = update.clone();
        self.blocking(move |db| {
            Self::modify_job(db, id, |job| {
                job.apply(&update, Timestamp::now())?;
                Ok(true)
            })?
            .ok_or_else(|| StoreError::not_found("job", id))
        })
        .await
    }

    async fn update_if_unmodified(
        &self,
        id: JobId,
        since: Timestamp,
        update: &JobUpdate,
    ) -> StoreResult<Option<Job>> {
        let update = update.clone();
        self.blocking(move |db| {
            Self::modify_job(db, id, |job| {
                if job.modified > since {
                    return Ok(false);
                }
                job.apply(&update, Timestamp::now())?;
                Ok(true)
            })
        })
        .await
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> StoreResult<Vec<Job>> {
        let statuses = statuses.to_vec();
        self.blocking(move |db| {
            let mut found = Self::scan_jobs(db, |j| statuses.contains(&j.status))?;
            found.sort_by_key(|j| (j.created, j.id));
            Ok(found)
        })
        .await
    }

    async fn predecessors_of(&self, id: JobId) -> StoreResult<Vec<Job>> {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let ids = {
                let index = txn.open_multimap_table(PREDECESSORS).map_err(db_err)?;
                let mut ids = Vec::new();
                for item in index.get(id.as_u64()).map_err(db_err)? {
                    ids.push(item.map_err(db_err)?.value());
                }
                ids
            };
            Self::load_jobs(&txn, &ids)
        })
        .await
    }

    async fn latest_prepare_job(
        &self,
        target: PrepareTarget,
        client_id: Option<ClientId>,
        repository_id: Option<RepositoryId>,
    ) -> StoreResult<Option<Job>> {
        self.blocking(move |db| {
            let key = prepare_key(target, client_id, repository_id);
            let txn = db.begin_read().map_err(db_err)?;
            let ids = {
                let index = txn.open_multimap_table(PREPARES).map_err(db_err)?;
                let mut ids = Vec::new();
                for item in index.get(key.as_str()).map_err(db_err)? {
                    ids.push(item.map_err(db_err)?.value());
                }
                ids
            };
            let found = Self::load_jobs(&txn, &ids)?;
            Ok(found
                .into_iter()
                .filter(|j| is_prepare_for(j, target, client_id, repository_id))
                .max_by_key(|j| (j.created, j.id)))
        })
        .await
    }

    async fn latest_successful_backup(
        &self,
        client_id: Option<ClientId>,
        repository_id: Option<RepositoryId>,
    ) -> StoreResult<Option<Job>> {
        self.blocking(move |db| {
            let found = Self::scan_jobs(db, |j| is_backup_of(j, client_id, repository_id))?;
            Ok(found.into_iter().max_by_key(|j| (j.finished, j.id)))
        })
        .await
    }

    async fn claim_completion_notice(&self, id: JobId) -> StoreResult<bool> {
        self.blocking(move |db| {
            let claimed = Self::modify_job(db, id, |job| {
                if job.completion_notified {
                    return Ok(false);
                }
                job.completion_notified = true;
                Ok(true)
            })?;
            Ok(claimed.is_some())
        })
        .await
    }
}

#[async_trait]
impl EventStore for RedbStore {
    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        let key = (event.job_id.as_u64(), event.counter);
        let json = serde_json::to_string(event)?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(EVENTS).map_err(db_err)?;
                table.insert(key, json.as_str()).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn events_for_job(&self, job_id: JobId) -> StoreResult<Vec<Event>> {
        let job = job_id.as_u64();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(EVENTS).map_err(db_err)?;
            let mut events = Vec::new();
            for item in table.range((job, 0)..=(job, u64::MAX)).map_err(db_err)? {
                let (_, value) = item.map_err(db_err)?;
                events.push(serde_json::from_str(value.value())?);
            }
            Ok(events)
        })
        .await
    }

    async fn insert_catalog_entries(
        &self,
        job_id: JobId,
        entries: &[CatalogEntry],
    ) -> StoreResult<usize> {
        let job = job_id.as_u64();
        let encoded = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(CATALOG).map_err(db_err)?;
                let mut next = match table
                    .range((job, 0)..=(job, u64::MAX))
                    .map_err(db_err)?
                    .next_back()
                {
                    Some(item) => item.map_err(db_err)?.0.value().1 + 1,
                    None => 0,
                };
                for json in &encoded {
                    table.insert((job, next), json.as_str()).map_err(db_err)?;
                    next += 1;
                }
            }
            txn.commit().map_err(db_err)?;
            Ok(encoded.len())
        })
        .await
    }
}
