//! BASTION Runtime
//!
//! The scheduler decides which queued jobs may run and materializes
//! preparation jobs ahead of them. The executor runs one job: it stages
//! credentials, spawns the built command under a pseudo-terminal, answers
//! prompts, enforces timeouts and cancellation, and finalizes the record.
//!
//! Everything shares one explicitly constructed [`Context`]; there is no
//! module-level state. The scheduler daemon owns the job store, and other
//! processes reach it through the [`control`] socket.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod cancel;
pub mod context;
pub mod control;
pub mod dependency;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod launch;
pub mod outcome;
pub mod process;
pub mod reconcile;
pub mod scheduler;
pub mod settings;
pub mod staging;

pub use admission::{Admission, BlockReason};
pub use cancel::{cancel_job, CancelOutcome};
pub use context::Context;
pub use control::{handle_request, ControlClient, ControlReply, ControlRequest, ControlServer};
pub use dispatch::{LocalDispatcher, ProcessRegistry, RecordingDispatcher, Task, TaskDispatcher};
pub use error::{RuntimeError, RuntimeResult};
pub use executor::JobRunner;
pub use launch::{launch_policy, submit_job};
pub use outcome::{RunOutcome, TaskError};
pub use process::{CancelCheck, Expiry, ProcessExit, ProcessLimits, ProcessSpec};
pub use reconcile::Reconciler;
pub use scheduler::{CycleReport, Scheduler};
pub use settings::{ExecutorSettings, SchedulerSettings};
pub use staging::Scratch;
