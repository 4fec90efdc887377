//! Pipeline settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pipeline knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Worker count
    pub workers: usize,
    /// Bound of each worker queue
    pub queue_capacity: usize,
    /// Worker dequeue timeout; bounds shutdown latency
    pub poll_interval_ms: u64,
    /// Backoff before retry `n` is `n` times this
    pub backoff_base_secs: u64,
    /// Retries after the first failed persist before escalating
    pub max_retries: u32,
    /// Polls for the job's `finished` timestamp after EOF
    pub finish_wait_attempts: u32,
    /// Interval between those polls
    pub finish_wait_interval_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
            poll_interval_ms: 500,
            backoff_base_secs: 60,
            max_retries: 2,
            finish_wait_attempts: 5,
            finish_wait_interval_ms: 1000,
        }
    }
}

impl IngestSettings {
    /// Worker count, at least one
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    /// Queue bound, at least one
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }

    /// Dequeue timeout
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Backoff before retry `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_base_secs.saturating_mul(u64::from(attempt)))
    }

    /// Interval between `finished` polls
    #[must_use]
    pub fn finish_wait_interval(&self) -> Duration {
        Duration::from_millis(self.finish_wait_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_linear() {
        let settings = IngestSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_secs(60));
        assert_eq!(settings.backoff(2), Duration::from_secs(120));
    }

    #[test]
    fn test_zero_workers_means_one() {
        let settings: IngestSettings = serde_json::from_str(r#"{"workers": 0}"#).unwrap();
        assert_eq!(settings.worker_count(), 1);
        assert_eq!(settings.queue_capacity, 1000);
    }
}
