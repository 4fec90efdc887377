//! Pipeline errors.

use bastion_core::JobId;
use bastion_storage::StoreError;

/// Result alias for the pipeline
pub type IngestResult<T> = Result<T, IngestError>;

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Storage stayed unavailable through every retry
    #[error("storage unavailable for job {job_id} after {attempts} attempts: {source}")]
    Escalated {
        /// Job whose payload could not be persisted
        job_id: JobId,
        /// Attempts made
        attempts: u32,
        /// Last storage error
        source: StoreError,
    },

    /// A worker task panicked or was aborted
    #[error("worker stopped abnormally: {0}")]
    WorkerLost(String),

    /// Reading the payload source failed
    #[error("source error: {0}")]
    Source(#[from] std::io::Error),
}
