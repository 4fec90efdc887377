//! Storage errors.

use bastion_core::CoreError;

/// Result alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Record does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Backend temporarily unavailable; the operation may be retried
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Operation can never succeed as issued
    #[error("permanent storage error: {0}")]
    Permanent(String),

    /// Update rejected by the job state machine
    #[error("update rejected: {0}")]
    Rejected(#[from] CoreError),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Record of `kind` with `id` does not exist
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        match err {
            redb::Error::DatabaseAlreadyOpen
            | redb::Error::Io(_)
            | redb::Error::LockPoisoned(_) => Self::Transient(err.to_string()),
            other => Self::Permanent(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(StoreError::Transient("db restarting".into()).is_transient());
        assert!(!StoreError::Permanent("constraint".into()).is_transient());
        assert!(!StoreError::not_found("job", 3).is_transient());
    }

    #[test]
    fn test_not_found_display() {
        assert_eq!(StoreError::not_found("job", "job_3").to_string(), "job not found: job_3");
    }
}
