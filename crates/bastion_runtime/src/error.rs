//! Runtime errors.

use bastion_core::CoreError;
use bastion_policy::ExpandError;
use bastion_storage::StoreError;
use bastion_tool::BuildError;

/// Runtime result type
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the scheduler, launcher and executor plumbing
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Storage failed
    #[error("storage: {0}")]
    Store(#[from] StoreError),

    /// A command could not be built
    #[error("build: {0}")]
    Build(#[from] BuildError),

    /// A policy could not be expanded
    #[error("launch: {0}")]
    Expand(#[from] ExpandError),

    /// A record violated a core rule
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Every reverse tunnel port is leased
    #[error("no free tunnel port")]
    TunnelPortsExhausted,

    /// Scratch staging or process spawning failed
    #[error("{context}: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Wrap an I/O error with context
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the same operation may succeed in a later cycle
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Io { .. } | Self::TunnelPortsExhausted => true,
            Self::Build(_) | Self::Expand(_) | Self::Core(_) => false,
        }
    }

    /// Render the error with its source chain
    #[must_use]
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            rendered.push_str("\ncaused by: ");
            rendered.push_str(&err.to_string());
            source = err.source();
        }
        rendered
    }
}
