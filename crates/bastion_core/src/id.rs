//! Identifiers for BASTION entities.
//!
//! Records owned by the storage layer use integer keys, matching the
//! `job_id: int` field of queue payloads. Correlation ids handed to the task
//! runtime are UUIDs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Create from a raw integer key
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw integer key
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Job identifier
    JobId,
    "job_"
);

numeric_id!(
    /// Policy identifier
    PolicyId,
    "policy_"
);

numeric_id!(
    /// Client (backed-up host) identifier
    ClientId,
    "client_"
);

numeric_id!(
    /// Repository identifier
    RepositoryId,
    "repo_"
);

/// Opaque correlation id tying a job to its external process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new random CorrelationId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_id_display() {
        assert_eq!(JobId::new(7).to_string(), "job_7");
        assert_eq!(RepositoryId::new(3).to_string(), "repo_3");
    }

    #[test]
    fn test_numeric_id_serializes_as_integer() {
        let json = serde_json::to_string(&JobId::new(12)).unwrap();
        assert_eq!(json, "12");
        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_u64(), 12);
    }

    #[test]
    fn test_correlation_id_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_correlation_id_parse() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
