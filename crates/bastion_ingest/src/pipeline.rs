//! Pipeline lifecycle.
//!
//! `run` owns the whole pool: it spawns one worker per queue, routes until
//! the source is exhausted or shutdown is requested, then closes the queues
//! and joins the workers. An exhausted source lets every worker drain its
//! queue; a shutdown stops them at the next poll.

use crate::error::{IngestError, IngestResult};
use crate::escalation::Escalation;
use crate::router::Router;
use crate::settings::IngestSettings;
use crate::source::PayloadSource;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::worker::Worker;
use bastion_core::Notifier;
use bastion_storage::{EventStore, JobStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Collaborators of the pipeline
#[derive(Clone)]
pub struct IngestContext {
    /// Event and catalog persistence
    pub events: Arc<dyn EventStore>,
    /// Job records, read for the finished-wait and completion claim
    pub jobs: Arc<dyn JobStore>,
    /// Pub/sub notifications
    pub notifier: Arc<dyn Notifier>,
    /// Reaction to a persistent storage outage
    pub escalation: Arc<dyn Escalation>,
}

/// Sharded ingestion pipeline
#[derive(Debug)]
pub struct Pipeline {
    ctx: IngestContext,
    settings: IngestSettings,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Create a pipeline
    #[must_use]
    pub fn new(ctx: IngestContext, settings: IngestSettings) -> Self {
        Self {
            ctx,
            settings,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Live counters
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Route payloads from `source` until it ends or `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns the first worker error, such as an escalated storage outage
    pub async fn run<S: PayloadSource>(
        &self,
        mut source: S,
        shutdown: CancellationToken,
    ) -> IngestResult<StatsSnapshot> {
        let workers = self.settings.worker_count();
        let stop = shutdown.child_token();
        let mut pool = JoinSet::new();
        let mut queues = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(self.settings.capacity());
            queues.push(tx);
            let worker = Worker::new(
                index,
                self.ctx.clone(),
                self.settings.clone(),
                Arc::clone(&self.stats),
            );
            let stop = stop.clone();
            pool.spawn(async move { (index, worker.run(rx, stop).await) });
        }
        tracing::info!(workers, capacity = self.settings.capacity(), "ingestion started");

        let mut router = Router::new(queues, Arc::clone(&self.stats));
        loop {
            let payload = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                payload = source.next_payload() => payload,
            };
            match payload {
                Some(payload) => {
                    router.route(payload);
                }
                None => {
                    tracing::info!("payload source exhausted");
                    break;
                }
            }
        }
        drop(router);

        let mut first_error = None;
        while let Some(joined) = pool.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((worker, Err(err))) => {
                    tracing::error!(worker, error = %err, "worker failed");
                    err
                }
                Err(err) => {
                    tracing::error!(error = %err, "worker task lost");
                    IngestError::WorkerLost(err.to_string())
                }
            };
            first_error.get_or_insert(err);
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            routed = snapshot.routed,
            persisted = snapshot.persisted,
            catalog_entries = snapshot.catalog_entries,
            eof = snapshot.eof,
            retried = snapshot.retried,
            dropped = snapshot.dropped(),
            "ingestion stopped"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(snapshot),
        }
    }
}

impl std::fmt::Debug for IngestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestContext").finish_non_exhaustive()
    }
}
