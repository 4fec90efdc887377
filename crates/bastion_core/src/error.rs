//! Core error types for BASTION.

use crate::job::JobStatus;
use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid encoding
    InvalidEncoding {
        /// Decoder message
        reason: String,
    },

    /// Validation error
    Validation { field: String, reason: String },

    /// Not found
    NotFound { kind: String, id: String },

    /// Status change not permitted by the job lifecycle
    InvalidTransition {
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Cancelled
    Cancelled,

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for a missing record
    #[must_use]
    pub fn not_found(kind: &str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding { reason } => write!(f, "Invalid encoding: {}", reason),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid status transition: {} -> {}", from, to)
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::not_found("Job", 42);
        assert_eq!(format!("{}", err), "Job not found: 42");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = CoreError::InvalidTransition {
            from: JobStatus::Successful,
            to: JobStatus::Running,
        };
        let s = format!("{}", err);
        assert!(s.contains("successful"));
        assert!(s.contains("running"));
    }

    #[test]
    fn test_from_json_error() {
        let err: CoreError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidEncoding { .. }));
    }
}
