//! Scheduler and executor settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Minimum seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
    /// A preparation job younger than this counts as recent
    pub prepare_recency_secs: u64,
    /// Hard cap on jobs in `starting`/`running`
    pub max_concurrent_jobs: Option<usize>,
    /// Seconds between periodic cycles
    pub cycle_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 180,
            prepare_recency_secs: 86_400,
            max_concurrent_jobs: None,
            cycle_interval_secs: 30,
        }
    }
}

impl SchedulerSettings {
    /// Reconciliation throttle
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Preparation recency window
    #[must_use]
    pub fn prepare_recency(&self) -> Duration {
        Duration::from_secs(self.prepare_recency_secs)
    }

    /// Periodic cycle interval
    #[must_use]
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }
}

/// Executor knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Hard wall-clock timeout (0 = none); a policy may override it
    pub timeout_secs: u64,
    /// Idle timeout, no output for this long (0 = none)
    pub idle_timeout_secs: u64,
    /// How often the cancel flag is re-read
    pub cancel_poll_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,
    /// Parent of per-job scratch directories (system temp dir when unset)
    pub scratch_root: Option<PathBuf>,
    /// Store error chains in `result_traceback`
    pub debug_tracebacks: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            idle_timeout_secs: 0,
            cancel_poll_interval_ms: 1000,
            kill_grace_ms: 2000,
            scratch_root: None,
            debug_tracebacks: false,
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl ExecutorSettings {
    /// Hard timeout, with an optional per-policy override
    #[must_use]
    pub fn timeout(&self, policy_override: Option<u64>) -> Option<Duration> {
        non_zero_secs(policy_override.unwrap_or(self.timeout_secs))
    }

    /// Idle timeout
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout_secs)
    }

    /// Cancel check interval
    #[must_use]
    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms.max(10))
    }

    /// SIGTERM to SIGKILL grace period
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}
