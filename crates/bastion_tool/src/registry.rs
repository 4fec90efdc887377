//! Builder registry keyed by job type.

use crate::builder::CommandBuilder;
use crate::builders::{BackupBuilder, CatalogBuilder, CheckBuilder, PruneBuilder, RestoreBuilder};
use crate::error::BuildError;
use bastion_core::JobType;
use indexmap::IndexMap;
use std::sync::Arc;

/// Registry of command builders
///
/// Each job type has at most one builder. Lookups hand out shared handles so
/// the executor can build outside any lock.
#[derive(Clone, Default)]
pub struct BuilderRegistry {
    builders: IndexMap<JobType, Arc<dyn CommandBuilder>>,
}

impl BuilderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the builder of every job type
    #[must_use]
    pub fn with_defaults() -> Self {
        let builders: [Arc<dyn CommandBuilder>; 5] = [
            Arc::new(BackupBuilder),
            Arc::new(CatalogBuilder),
            Arc::new(PruneBuilder),
            Arc::new(RestoreBuilder),
            Arc::new(CheckBuilder),
        ];
        Self {
            builders: builders
                .into_iter()
                .map(|builder| (builder.job_type(), builder))
                .collect(),
        }
    }

    /// Register a builder
    ///
    /// # Errors
    ///
    /// Returns error if the job type already has a builder
    pub fn register(&mut self, builder: Arc<dyn CommandBuilder>) -> Result<(), BuildError> {
        let job_type = builder.job_type();
        if self.builders.contains_key(&job_type) {
            return Err(BuildError::AlreadyRegistered(job_type));
        }
        self.builders.insert(job_type, builder);
        Ok(())
    }

    /// Replace the builder of a job type, returning the previous one
    pub fn replace(&mut self, builder: Arc<dyn CommandBuilder>) -> Option<Arc<dyn CommandBuilder>> {
        self.builders.insert(builder.job_type(), builder)
    }

    /// Builder for a job type
    ///
    /// # Errors
    ///
    /// Returns error if no builder is registered
    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn CommandBuilder>, BuildError> {
        self.builders
            .get(&job_type)
            .map(Arc::clone)
            .ok_or(BuildError::NoBuilder(job_type))
    }

    /// Job types with a builder, in registration order
    #[must_use]
    pub fn job_types(&self) -> Vec<JobType> {
        self.builders.keys().copied().collect()
    }
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
