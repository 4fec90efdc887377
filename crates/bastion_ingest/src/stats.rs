//! Pipeline counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the router and the workers
#[derive(Debug, Default)]
pub struct PipelineStats {
    routed: AtomicU64,
    persisted: AtomicU64,
    catalog_entries: AtomicU64,
    eof: AtomicU64,
    retried: AtomicU64,
    dropped_full: AtomicU64,
    dropped_permanent: AtomicU64,
    malformed: AtomicU64,
    escalations: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Payloads handed to a worker
    pub routed: u64,
    /// Events persisted
    pub persisted: u64,
    /// Catalog entries persisted
    pub catalog_entries: u64,
    /// EOF sentinels handled
    pub eof: u64,
    /// Persist attempts retried after a transient error
    pub retried: u64,
    /// Payloads dropped because every worker queue was full
    pub dropped_full: u64,
    /// Payloads dropped on a permanent storage error
    pub dropped_permanent: u64,
    /// Payloads that could not be classified
    pub malformed: u64,
    /// Escalations fired
    pub escalations: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_routed => routed,
        record_persisted => persisted,
        record_eof => eof,
        record_retry => retried,
        record_dropped_full => dropped_full,
        record_dropped_permanent => dropped_permanent,
        record_malformed => malformed,
        record_escalation => escalations,
    }

    pub(crate) fn record_catalog(&self, entries: usize) {
        self.catalog_entries
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    /// Copy the counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            routed: load(&self.routed),
            persisted: load(&self.persisted),
            catalog_entries: load(&self.catalog_entries),
            eof: load(&self.eof),
            retried: load(&self.retried),
            dropped_full: load(&self.dropped_full),
            dropped_permanent: load(&self.dropped_permanent),
            malformed: load(&self.malformed),
            escalations: load(&self.escalations),
        }
    }
}

impl StatsSnapshot {
    /// Payloads lost for any reason
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_full + self.dropped_permanent + self.malformed
    }
}
