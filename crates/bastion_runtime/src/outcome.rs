//! Executor outcomes.
//!
//! Expected endings (cancellation, a failing command, a broken setup) are
//! values of [`RunOutcome`]. They turn into a [`TaskError`] only where the
//! dispatcher needs an error to fire its failure continuation.

use bastion_core::{JobId, JobStatus};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code zero, no expiry fired
    Success,
    /// Terminated on request
    Canceled {
        /// Exit code, if the process exited normally
        rc: Option<i32>,
    },
    /// Non-zero exit, timeout, or a failed pre-run hook
    Failed {
        /// Exit code, if any
        rc: Option<i32>,
        /// Human-readable reason
        reason: String,
    },
    /// Failed before the process was spawned
    SetupError {
        /// Cause
        cause: String,
    },
}

impl RunOutcome {
    /// Terminal status recorded for this outcome
    #[must_use]
    pub const fn status(&self) -> JobStatus {
        match self {
            Self::Success => JobStatus::Successful,
            Self::Canceled { .. } => JobStatus::Canceled,
            Self::Failed { .. } => JobStatus::Failed,
            Self::SetupError { .. } => JobStatus::Error,
        }
    }

    /// Explanation stored on the job
    #[must_use]
    pub fn explanation(&self) -> String {
        match self {
            Self::Success => String::new(),
            Self::Canceled { .. } => "Job was canceled".to_string(),
            Self::Failed { reason, .. } => reason.clone(),
            Self::SetupError { cause } => format!("Job could not be started: {}", cause),
        }
    }

    /// Whether the run succeeded
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Convert for the task runtime boundary
    ///
    /// # Errors
    ///
    /// Returns error for every outcome but success
    pub fn into_result(self, job: JobId) -> Result<(), TaskError> {
        match self {
            Self::Success => Ok(()),
            Self::Canceled { .. } => Err(TaskError::Canceled { job }),
            Self::Failed { reason, .. } => Err(TaskError::Failed { job, reason }),
            Self::SetupError { cause } => Err(TaskError::Setup { job, cause }),
        }
    }
}

/// Error raised to the task runtime when a run did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Process failed
    #[error("{job} failed: {reason}")]
    Failed {
        /// Job
        job: JobId,
        /// Why
        reason: String,
    },

    /// Setup failed
    #[error("{job} could not be started: {cause}")]
    Setup {
        /// Job
        job: JobId,
        /// Why
        cause: String,
    },

    /// Canceled on request
    #[error("{job} was canceled")]
    Canceled {
        /// Job
        job: JobId,
    },

    /// The job record could not be read or written
    #[error("{job}: storage unavailable: {reason}")]
    Storage {
        /// Job
        job: JobId,
        /// Why
        reason: String,
    },
}

impl TaskError {
    /// Job the error belongs to
    #[must_use]
    pub const fn job(&self) -> JobId {
        match self {
            Self::Failed { job, .. }
            | Self::Setup { job, .. }
            | Self::Canceled { job }
            | Self::Storage { job, .. } => *job,
        }
    }

    /// Cancellation is not treated as a failure for notifications
    #[must_use]
    pub const fn is_cancel(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_statuses() {
        assert_eq!(RunOutcome::Success.status(), JobStatus::Successful);
        assert_eq!(RunOutcome::Canceled { rc: None }.status(), JobStatus::Canceled);
        assert_eq!(
            RunOutcome::Failed { rc: Some(2), reason: "rc 2".into() }.status(),
            JobStatus::Failed
        );
        assert_eq!(
            RunOutcome::SetupError { cause: "no key".into() }.status(),
            JobStatus::Error
        );
    }

    #[test]
    fn test_into_result_boundary() {
        let job = JobId::new(3);
        assert_eq!(RunOutcome::Success.into_result(job), Ok(()));
        let err = RunOutcome::Canceled { rc: Some(143) }.into_result(job).unwrap_err();
        assert!(err.is_cancel());
        assert_eq!(err.job(), job);
        let err = RunOutcome::SetupError { cause: "mkfifo".into() }
            .into_result(job)
            .unwrap_err();
        assert!(err.to_string().contains("mkfifo"));
    }
}
