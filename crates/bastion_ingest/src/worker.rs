//! Ingestion worker.
//!
//! One worker drains one queue in FIFO order. Per payload:
//! - job events are persisted with retry
//! - catalog payloads are decoded and persisted with retry
//! - an EOF sentinel publishes the events summary, waits briefly for the
//!   job to record `finished`, then publishes the completion notification
//!   once per job
//!
//! A job still unfinished after that wait is remembered and rechecked while
//! the worker runs; its completion is claimed only once `finished` is set.

use crate::error::{IngestError, IngestResult};
use crate::pipeline::IngestContext;
use crate::settings::IngestSettings;
use crate::stats::PipelineStats;
use bastion_core::{Job, JobId, Notification};
use bastion_log::{PayloadKind, QueuePayload};
use bastion_storage::{StoreError, StoreResult};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// What became of one persisted payload
enum Persisted {
    Stored,
    Dropped,
}

/// Drains one worker queue
pub struct Worker {
    index: usize,
    ctx: IngestContext,
    settings: IngestSettings,
    stats: Arc<PipelineStats>,
    late: Mutex<BTreeSet<JobId>>,
}

impl Worker {
    /// Create worker `index`
    #[must_use]
    pub fn new(
        index: usize,
        ctx: IngestContext,
        settings: IngestSettings,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            index,
            ctx,
            settings,
            stats,
            late: Mutex::new(BTreeSet::new()),
        }
    }

    /// Drain `queue` until it closes or `stop` fires
    ///
    /// # Errors
    ///
    /// Returns `Escalated` after storage stayed unavailable; `stop` is
    /// cancelled first so the rest of the pool winds down too.
    pub async fn run(
        self,
        mut queue: mpsc::Receiver<QueuePayload>,
        stop: CancellationToken,
    ) -> IngestResult<()> {
        tracing::debug!(worker = self.index, "worker started");
        let mut last_check = Instant::now();
        while !stop.is_cancelled() {
            if last_check.elapsed() >= self.settings.finish_wait_interval() {
                self.recheck_late().await;
                last_check = Instant::now();
            }
            let payload = match timeout(self.settings.poll_interval(), queue.recv()).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    self.recheck_late().await;
                    break;
                }
                Err(_) => continue,
            };
            if let Err(err) = self.handle(payload).await {
                stop.cancel();
                return Err(err);
            }
        }
        let pending = self.late_count();
        if pending > 0 {
            tracing::info!(worker = self.index, pending, "completion notices left unsent");
        }
        tracing::debug!(worker = self.index, "worker stopped");
        Ok(())
    }

    /// Process one payload
    ///
    /// # Errors
    ///
    /// Returns `Escalated` if storage stayed unavailable
    pub async fn handle(&self, payload: QueuePayload) -> IngestResult<()> {
        let kind = match payload.classify() {
            Ok(kind) => kind,
            Err(err) => {
                self.stats.record_malformed();
                tracing::warn!(worker = self.index, job_id = ?payload.job_id, error = %err, "dropping payload");
                return Ok(());
            }
        };
        match kind {
            PayloadKind::JobEvent(event) => {
                let (job_id, counter) = (event.job_id, event.counter);
                let (events, record) = (&self.ctx.events, &event);
                let outcome = self
                    .persist(job_id, || async move { events.insert_event(record).await })
                    .await?;
                if let Persisted::Stored = outcome {
                    self.stats.record_persisted();
                    tracing::trace!(worker = self.index, %job_id, counter, "event persisted");
                }
            }
            PayloadKind::Catalog { job_id, entries } => {
                let (events, batch) = (&self.ctx.events, &entries);
                let outcome = self
                    .persist(job_id, || async move {
                        events.insert_catalog_entries(job_id, batch).await
                    })
                    .await?;
                if let Persisted::Stored = outcome {
                    self.stats.record_catalog(entries.len());
                    tracing::debug!(worker = self.index, %job_id, entries = entries.len(), "catalog persisted");
                }
            }
            PayloadKind::Eof {
                job_id,
                final_counter,
            } => self.finish(job_id, final_counter).await,
        }
        Ok(())
    }

    /// Run `op` with linear backoff on transient errors
    async fn persist<F, Fut, T>(&self, job_id: JobId, mut op: F) -> IngestResult<Persisted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(_) => return Ok(Persisted::Stored),
                Err(err) => err,
            };
            if !err.is_transient() {
                self.stats.record_dropped_permanent();
                tracing::warn!(worker = self.index, %job_id, error = %err, "dropping payload");
                return Ok(Persisted::Dropped);
            }
            attempt += 1;
            if attempt > self.settings.max_retries {
                return Err(self.escalate(job_id, attempt, err));
            }
            let backoff = self.settings.backoff(attempt);
            tracing::warn!(
                worker = self.index,
                %job_id,
                attempt,
                backoff_secs = backoff.as_secs(),
                error = %err,
                "storage unavailable, retrying"
            );
            self.stats.record_retry();
            sleep(backoff).await;
        }
    }

    fn escalate(&self, job_id: JobId, attempts: u32, source: StoreError) -> IngestError {
        let err = IngestError::Escalated {
            job_id,
            attempts,
            source,
        };
        self.stats.record_escalation();
        self.ctx.escalation.escalate(&err.to_string());
        err
    }

    async fn finish(&self, job_id: JobId, final_counter: u64) {
        self.stats.record_eof();
        self.ctx
            .notifier
            .publish(Notification::events_summary(job_id, final_counter));

        match self.wait_finished(job_id).await {
            Some(job) if job.finished.is_some() => self.notify_completion(&job).await,
            Some(job) => {
                tracing::debug!(worker = self.index, %job_id, status = %job.status, "completion deferred until the job finishes");
                if let Ok(mut late) = self.late.lock() {
                    late.insert(job_id);
                }
            }
            None => {}
        }
    }

    async fn notify_completion(&self, job: &Job) {
        let job_id = job.id;
        match self.ctx.jobs.claim_completion_notice(job_id).await {
            Ok(true) => {
                tracing::debug!(worker = self.index, %job_id, status = %job.status, "job completed");
                self.ctx.notifier.publish(Notification::job_completed(job));
            }
            Ok(false) => tracing::debug!(worker = self.index, %job_id, "completion already notified"),
            Err(err) => {
                tracing::warn!(worker = self.index, %job_id, error = %err, "cannot claim completion notice");
            }
        }
    }

    fn late_count(&self) -> usize {
        self.late.lock().map(|late| late.len()).unwrap_or(0)
    }

    /// Publish completions for deferred jobs that have finished since
    pub async fn recheck_late(&self) {
        let pending: Vec<JobId> = match self.late.lock() {
            Ok(late) => late.iter().copied().collect(),
            Err(_) => return,
        };
        for job_id in pending {
            let settled = match self.ctx.jobs.get_job(job_id).await {
                Ok(job) if job.finished.is_some() => {
                    self.notify_completion(&job).await;
                    true
                }
                Ok(_) => false,
                Err(StoreError::NotFound { .. }) => true,
                Err(err) => {
                    tracing::debug!(worker = self.index, %job_id, error = %err, "cannot recheck job");
                    false
                }
            };
            if settled {
                if let Ok(mut late) = self.late.lock() {
                    late.remove(&job_id);
                }
            }
        }
    }

    /// Poll for the job's `finished` timestamp
    ///
    /// The last events can commit before the runner commits the terminal
    /// status. Returns the last record read, finished or not.
    async fn wait_finished(&self, job_id: JobId) -> Option<Job> {
        let attempts = self.settings.finish_wait_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.ctx.jobs.get_job(job_id).await {
                Ok(job) if job.finished.is_some() => return Some(job),
                Ok(job) => last = Some(job),
                Err(StoreError::NotFound { .. }) => {
                    tracing::warn!(worker = self.index, %job_id, "EOF for unknown job");
                    return None;
                }
                Err(err) => tracing::debug!(worker = self.index, %job_id, error = %err, "cannot load job"),
            }
            if attempt < attempts {
                sleep(self.settings.finish_wait_interval()).await;
            }
        }
        tracing::debug!(worker = self.index, %job_id, "job not finished after EOF");
        last
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::RecordingEscalation;
    use bastion_core::notify::{GROUP_COMPLETIONS, GROUP_JOB_EVENTS};
    use bastion_core::{JobStatus, JobType, JobUpdate, LaunchType, MemoryNotifier, Timestamp};
    use bastion_log::catalog::{self, CatalogEntry};
    use bastion_storage::{JobStore, MemoryStore, StoreFault};

    struct Harness {
        store: Arc<MemoryStore>,
        notifier: Arc<MemoryNotifier>,
        escalation: Arc<RecordingEscalation>,
        stats: Arc<PipelineStats>,
        worker: Worker,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let escalation = Arc::new(RecordingEscalation::new());
        let stats = Arc::new(PipelineStats::new());
        let ctx = IngestContext {
            events: store.clone(),
            jobs: store.clone(),
            notifier: notifier.clone(),
            escalation: escalation.clone(),
        };
        let settings = IngestSettings {
            finish_wait_interval_ms: 10,
            ..IngestSettings::default()
        };
        let worker = Worker::new(0, ctx, settings, stats.clone());
        Harness {
            store,
            notifier,
            escalation,
            stats,
            worker,
        }
    }

    fn event(job: u64, counter: u64) -> QueuePayload {
        QueuePayload {
            job_id: Some(JobId::new(job)),
            counter: Some(counter),
            stdout: Some(format!("line {}", counter)),
            start_line: Some(counter),
            end_line: Some(counter + 1),
            ..QueuePayload::default()
        }
    }

    fn finished_job(store: &MemoryStore, id: u64) {
        let mut job = Job::new(JobId::new(id), JobType::Backup, LaunchType::Manual);
        job.status = JobStatus::Successful;
        job.finished = Some(Timestamp::now());
        store.insert_job(job);
    }

    #[tokio::test]
    async fn test_eof_replay_notifies_once() {
        let h = harness();
        finished_job(&h.store, 7);

        let eof = QueuePayload::eof(JobId::new(7), 12, None);
        h.worker.handle(eof.clone()).await.unwrap();
        h.worker.handle(eof).await.unwrap();

        assert_eq!(h.notifier.in_group(GROUP_JOB_EVENTS).len(), 2);
        let completions = h.notifier.in_group(GROUP_COMPLETIONS);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, Some(JobStatus::Successful));
        assert_eq!(h.stats.snapshot().eof, 2);
    }

    #[tokio::test]
    async fn test_eof_waits_for_finished() {
        let h = harness();
        let job = Job::new(JobId::new(3), JobType::Prune, LaunchType::Manual)
            .with_status(JobStatus::Running);
        h.store.insert_job(job);

        let store = h.store.clone();
        let finisher = tokio::spawn(async move {
            sleep(std::time::Duration::from_millis(15)).await;
            store
                .update_job(JobId::new(3), &JobUpdate::status(JobStatus::Failed))
                .await
                .unwrap();
        });
        h.worker.handle(QueuePayload::eof(JobId::new(3), 1, None)).await.unwrap();
        finisher.await.unwrap();

        let completions = h.notifier.in_group(GROUP_COMPLETIONS);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_eof_before_finish_defers_completion() {
        let h = harness();
        let job = Job::new(JobId::new(4), JobType::Backup, LaunchType::Manual)
            .with_status(JobStatus::Running);
        h.store.insert_job(job);

        h.worker.handle(QueuePayload::eof(JobId::new(4), 2, None)).await.unwrap();
        assert!(h.notifier.in_group(GROUP_COMPLETIONS).is_empty());
        assert!(!h.store.get_job(JobId::new(4)).await.unwrap().completion_notified);
        assert_eq!(h.worker.late_count(), 1);

        h.worker.recheck_late().await;
        assert!(h.notifier.in_group(GROUP_COMPLETIONS).is_empty());

        h.store
            .update_job(JobId::new(4), &JobUpdate::status(JobStatus::Successful))
            .await
            .unwrap();
        h.worker.recheck_late().await;
        h.worker.recheck_late().await;
        let completions = h.notifier.in_group(GROUP_COMPLETIONS);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, Some(JobStatus::Successful));
        assert_eq!(h.worker.late_count(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_sends_deferred_completion() {
        let h = harness();
        let job = Job::new(JobId::new(6), JobType::Prune, LaunchType::Manual)
            .with_status(JobStatus::Running);
        h.store.insert_job(job);

        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::spawn(h.worker.run(rx, CancellationToken::new()));
        tx.send(QueuePayload::eof(JobId::new(6), 0, None)).await.unwrap();
        // Five polls 10ms apart give up well before this.
        sleep(std::time::Duration::from_millis(200)).await;
        assert!(h.notifier.in_group(GROUP_COMPLETIONS).is_empty());

        h.store
            .update_job(JobId::new(6), &JobUpdate::status(JobStatus::Failed))
            .await
            .unwrap();
        drop(tx);
        worker.await.unwrap().unwrap();
        assert_eq!(h.notifier.in_group(GROUP_COMPLETIONS).len(), 1);
    }

    #[tokio::test]
    async fn test_eof_for_unknown_job_only_summarizes() {
        let h = harness();
        h.worker.handle(QueuePayload::eof(JobId::new(99), 0, None)).await.unwrap();
        assert_eq!(h.notifier.in_group(GROUP_JOB_EVENTS).len(), 1);
        assert!(h.notifier.in_group(GROUP_COMPLETIONS).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried() {
        let h = harness();
        h.store.inject_event_faults([StoreFault::Transient]);
        h.worker.handle(event(1, 1)).await.unwrap();

        assert_eq!(h.store.events().len(), 1);
        let stats = h.stats.snapshot();
        assert_eq!((stats.retried, stats.persisted), (1, 1));
        assert!(h.escalation.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_outage_escalates() {
        let h = harness();
        h.store
            .inject_event_faults([StoreFault::Transient, StoreFault::Transient, StoreFault::Transient]);
        let started = tokio::time::Instant::now();
        let err = h.worker.handle(event(1, 1)).await.unwrap_err();

        assert!(matches!(err, IngestError::Escalated { attempts: 3, .. }));
        // 60s before the first retry, 120s before the second
        assert!(started.elapsed() >= std::time::Duration::from_secs(180));
        assert_eq!(h.escalation.reasons().len(), 1);
        assert!(h.store.events().is_empty());
        assert_eq!(h.stats.snapshot().retried, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_drops_payload() {
        let h = harness();
        h.store.inject_event_faults([StoreFault::Permanent]);
        h.worker.handle(event(1, 1)).await.unwrap();
        h.worker.handle(event(1, 2)).await.unwrap();

        let counters: Vec<_> = h.store.events().iter().map(|e| e.counter).collect();
        assert_eq!(counters, vec![2]);
        let stats = h.stats.snapshot();
        assert_eq!((stats.dropped_permanent, stats.persisted), (1, 1));
    }

    #[tokio::test]
    async fn test_catalog_payload_is_decoded() {
        let h = harness();
        let entries = vec![CatalogEntry {
            archive_name: "host1-4-2026-10-18T00:00:00".into(),
            path: "etc/hosts".into(),
            kind: "-".into(),
            mode: "-rw-r--r--".into(),
            size: 220,
            mtime: None,
            user: Some("root".into()),
            group: Some("root".into()),
        }];
        let blob = catalog::encode(&entries).unwrap();
        h.worker
            .handle(QueuePayload::catalog(JobId::new(4), blob))
            .await
            .unwrap();
        assert_eq!(h.store.catalog_entries(JobId::new(4)), entries);
        assert_eq!(h.stats.snapshot().catalog_entries, 1);
    }

    #[tokio::test]
    async fn test_unclassified_payload_is_counted() {
        let h = harness();
        h.worker.handle(QueuePayload::default()).await.unwrap();
        assert_eq!(h.stats.snapshot().malformed, 1);
    }
}
