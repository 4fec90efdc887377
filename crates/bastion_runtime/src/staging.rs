//! Per-job scratch directories.
//!
//! Each run gets a fresh `0700` directory that is removed on drop. SSH keys
//! are staged as named pipes: a writer thread blocks until the consumer
//! opens the pipe, writes the key once and exits. Keys never touch the disk.

use bastion_core::Secret;
use bastion_tool::ScratchFile;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use zeroize::Zeroizing;

struct StagedPipe {
    path: PathBuf,
    consumed: Arc<AtomicBool>,
}

/// Exclusively owned scratch directory
pub struct Scratch {
    dir: Option<TempDir>,
    pipes: Vec<StagedPipe>,
}

impl Scratch {
    /// Create a scratch directory under `root` (system temp dir when `None`)
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or restricted
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bastion-job-");
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        fs::set_permissions(dir.path(), Permissions::from_mode(0o700))?;
        Ok(Self {
            dir: Some(dir),
            pipes: Vec::new(),
        })
    }

    /// Directory path
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.as_ref().map_or_else(|| Path::new(""), TempDir::path)
    }

    /// Stage `secret` behind a named pipe, readable exactly once
    ///
    /// # Errors
    ///
    /// Returns error if the pipe cannot be created
    pub fn stage_secret(&mut self, name: &str, secret: &Secret) -> io::Result<PathBuf> {
        let path = self.path().join(name);
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;

        let value = Zeroizing::new(secret.expose().as_bytes().to_vec());
        let consumed = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&consumed);
        let target = path.clone();
        std::thread::Builder::new()
            .name(format!("bastion-fifo-{}", name))
            .spawn(move || {
                // Blocks until a reader opens the pipe.
                let written = OpenOptions::new()
                    .write(true)
                    .open(&target)
                    .and_then(|mut pipe| pipe.write_all(&value));
                if let Err(err) = written {
                    if err.kind() != io::ErrorKind::BrokenPipe {
                        tracing::warn!(path = %target.display(), error = %err, "secret pipe write failed");
                    }
                }
                done.store(true, Ordering::SeqCst);
            })?;

        self.pipes.push(StagedPipe {
            path: path.clone(),
            consumed,
        });
        Ok(path)
    }

    /// Write a file the command expects
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn write_file(&self, file: &ScratchFile) -> io::Result<PathBuf> {
        let path = self.path().join(&file.name);
        let mut handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(file.mode)
            .open(&path)?;
        handle.write_all(file.contents.expose().as_bytes())?;
        // Creation mode is filtered by the umask.
        fs::set_permissions(&path, Permissions::from_mode(file.mode))?;
        Ok(path)
    }

    /// Release unread pipes and remove the directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be removed
    pub fn close(mut self) -> io::Result<()> {
        self.release_pipes();
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }

    /// Returns the number of pipes that could not be opened for release
    fn release_pipes(&mut self) -> usize {
        let mut stuck = 0;
        for pipe in self.pipes.drain(..) {
            if pipe.consumed.load(Ordering::SeqCst) {
                continue;
            }
            // Opening the read end unblocks a writer still waiting for a
            // consumer; the data is discarded with the pipe.
            let released = OpenOptions::new()
                .read(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(&pipe.path);
            if let Err(err) = released {
                tracing::debug!(path = %pipe.path.display(), error = %err, "cannot release secret pipe");
                stuck += 1;
            }
        }
        stuck
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.release_pipes();
    }
}

impl std::fmt::Debug for Scratch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scratch")
            .field("path", &self.path())
            .field("pipes", &self.pipes.len())
            .finish()
    }
}
