//! Advisory locks serializing scheduler cycles.
//!
//! Acquisition never waits: a held lock means another cycle is running and
//! the caller skips its own.

use crate::error::{StoreError, StoreResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Held lock; released on drop
pub struct LockGuard {
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    fn new(held: impl Send + Sync + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Non-blocking mutual exclusion
pub trait AdvisoryLock: Send + Sync {
    /// Take the lock if free
    ///
    /// Returns `None` when another holder has it.
    fn try_lock(&self) -> StoreResult<Option<LockGuard>>;
}

/// Lock shared by schedulers inside one process
#[derive(Debug, Clone, Default)]
pub struct LocalLock {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl LocalLock {
    /// Create an unlocked lock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdvisoryLock for LocalLock {
    fn try_lock(&self) -> StoreResult<Option<LockGuard>> {
        Ok(Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(LockGuard::new))
    }
}

/// `flock(2)` on a lock file, shared by every process on the host
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Lock on `path`; the file is created on first use
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl AdvisoryLock for FileLock {
    fn try_lock(&self) -> StoreResult<Option<LockGuard>> {
        let file: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|err| {
                StoreError::Transient(format!("lock file {}: {}", self.path.display(), err))
            })?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => Ok(Some(LockGuard::new(locked))),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(StoreError::Transient(format!(
                "flock {}: {}",
                self.path.display(),
                errno
            ))),
        }
    }
}
