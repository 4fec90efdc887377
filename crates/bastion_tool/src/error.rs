//! Builder errors.

use bastion_core::{JobId, JobType};

/// Errors raised while building a command line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// Job references configuration that was not loaded
    #[error("job {job} has no {what}")]
    MissingConfig {
        /// Job being built
        job: JobId,
        /// Missing record
        what: &'static str,
    },

    /// A required secret is not configured
    #[error("job {job} needs {what}, which is not configured")]
    MissingSecret {
        /// Job being built
        job: JobId,
        /// Missing secret
        what: &'static str,
    },

    /// Launch options are incomplete or inconsistent
    #[error("job {job}: {reason}")]
    InvalidOptions {
        /// Job being built
        job: JobId,
        /// Why
        reason: String,
    },

    /// No builder is registered for the job type
    #[error("no command builder for {0} jobs")]
    NoBuilder(JobType),

    /// Builder registered twice
    #[error("command builder for {0} jobs already registered")]
    AlreadyRegistered(JobType),
}
