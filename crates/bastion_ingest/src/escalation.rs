//! Fail-fast escalation.
//!
//! When storage stays unavailable through every retry, the pipeline takes
//! its own process down with SIGTERM so the outage is visible to the
//! supervisor instead of silently stalling the queue.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::Mutex;

/// Reaction to a persistent storage outage
pub trait Escalation: Send + Sync {
    /// Escalate with a human-readable reason
    fn escalate(&self, reason: &str);
}

/// Sends SIGTERM to the current process
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalEscalation;

impl Escalation for SignalEscalation {
    fn escalate(&self, reason: &str) {
        tracing::error!(%reason, "storage unavailable, terminating");
        if let Err(err) = kill(Pid::this(), Signal::SIGTERM) {
            tracing::error!(error = %err, "failed to signal own process");
        }
    }
}

/// Records escalations instead of acting on them
#[derive(Debug, Default)]
pub struct RecordingEscalation {
    reasons: Mutex<Vec<String>>,
}

impl RecordingEscalation {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons recorded so far
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Escalation for RecordingEscalation {
    fn escalate(&self, reason: &str) {
        tracing::warn!(%reason, "escalation recorded");
        if let Ok(mut reasons) = self.reasons.lock() {
            reasons.push(reason.to_string());
        }
    }
}
