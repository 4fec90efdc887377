//! Pub/sub notifications.
//!
//! Every job transition publishes `{group_name, job_id, status, ...}`;
//! policy launches publish `{group_name: "schedules", id}`.

use crate::id::{JobId, PolicyId};
use crate::job::{Job, JobStatus, JobType};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Group for job status changes
pub const GROUP_JOBS: &str = "jobs";
/// Group for policy window advances
pub const GROUP_SCHEDULES: &str = "schedules";
/// Group for end-of-stream summaries
pub const GROUP_JOB_EVENTS: &str = "job_events";
/// Group for post-completion notices
pub const GROUP_COMPLETIONS: &str = "job_completions";
/// Group for after-backup notices
pub const GROUP_AFTER_BACKUP: &str = "after_backup";

/// A notification payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Subscription group
    pub group_name: String,
    /// Job concerned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Policy concerned (schedules group)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PolicyId>,
    /// Job status at publication time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    /// Job type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobType>,
    /// Extra fields
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Notification {
    fn for_job(group: &str, job: &Job) -> Self {
        Self {
            group_name: group.to_string(),
            job_id: Some(job.id),
            id: None,
            status: Some(job.status),
            job_type: Some(job.job_type),
            extra: serde_json::Map::new(),
        }
    }

    /// Job changed status
    #[must_use]
    pub fn status_changed(job: &Job) -> Self {
        let mut n = Self::for_job(GROUP_JOBS, job);
        if !job.job_explanation.is_empty() {
            n.extra.insert(
                "job_explanation".to_string(),
                job.job_explanation.clone().into(),
            );
        }
        n
    }

    /// Job finished and all of its events are stored
    #[must_use]
    pub fn job_completed(job: &Job) -> Self {
        let mut n = Self::for_job(GROUP_COMPLETIONS, job);
        if let Some(elapsed) = job.elapsed {
            n.extra.insert("elapsed".to_string(), elapsed.into());
        }
        n
    }

    /// A plain backup finished
    #[must_use]
    pub fn after_backup(job: &Job) -> Self {
        let mut n = Self::for_job(GROUP_AFTER_BACKUP, job);
        if let Some(archive) = &job.archive_name {
            n.extra.insert("archive_name".to_string(), archive.clone().into());
        }
        n
    }

    /// End of a job's output stream
    #[must_use]
    pub fn events_summary(job_id: JobId, final_counter: u64) -> Self {
        let mut extra = serde_json::Map::new();
        extra.insert("final_counter".to_string(), final_counter.into());
        Self {
            group_name: GROUP_JOB_EVENTS.to_string(),
            job_id: Some(job_id),
            id: None,
            status: None,
            job_type: None,
            extra,
        }
    }

    /// Policy window advanced
    #[must_use]
    pub fn schedule_advanced(policy_id: PolicyId) -> Self {
        Self {
            group_name: GROUP_SCHEDULES.to_string(),
            job_id: None,
            id: Some(policy_id),
            status: None,
            job_type: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Publishes notifications
///
/// Publication is fire-and-forget: implementations must not block the caller
/// on a slow subscriber.
pub trait Notifier: Send + Sync {
    /// Publish one notification
    fn publish(&self, notification: Notification);
}

/// Notifier that writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn publish(&self, notification: Notification) {
        match serde_json::to_string(&notification) {
            Ok(json) => tracing::info!(group = %notification.group_name, "notify {}", json),
            Err(err) => tracing::warn!("unserializable notification: {}", err),
        }
    }
}

/// Notifier that records notifications in memory
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Notifications of one group
    #[must_use]
    pub fn in_group(&self, group: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.group_name == group)
            .collect()
    }
}

impl Notifier for MemoryNotifier {
    fn publish(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::LaunchType;

    #[test]
    fn test_status_changed_shape() {
        let job = Job::new(JobId::new(5), JobType::Backup, LaunchType::Scheduled);
        let json = serde_json::to_value(Notification::status_changed(&job)).unwrap();
        assert_eq!(json["group_name"], "jobs");
        assert_eq!(json["job_id"], 5);
        assert_eq!(json["status"], "new");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_schedule_advanced_shape() {
        let json = serde_json::to_value(Notification::schedule_advanced(PolicyId::new(9))).unwrap();
        assert_eq!(json["group_name"], "schedules");
        assert_eq!(json["id"], 9);
    }

    #[test]
    fn test_memory_notifier_groups() {
        let notifier = MemoryNotifier::new();
        notifier.publish(Notification::schedule_advanced(PolicyId::new(1)));
        notifier.publish(Notification::events_summary(JobId::new(1), 10));
        assert_eq!(notifier.sent().len(), 2);
        assert_eq!(notifier.in_group(GROUP_SCHEDULES).len(), 1);
    }
}
