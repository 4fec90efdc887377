//! Signal-driven shutdown.
//!
//! SIGTERM or SIGINT cancels the pipeline. Once the workers have stopped,
//! [`reraise`] restores the default disposition and raises the same signal
//! again, so a supervisor sees a normal signal death rather than exit 0.

use nix::sys::signal::{self, SigHandler, Signal};
use std::io;
use tokio::signal::unix::{signal as listen, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Listener for termination signals
#[derive(Debug)]
pub struct ShutdownSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Install handlers for SIGTERM and SIGINT
    ///
    /// # Errors
    ///
    /// Returns error if a handler cannot be registered
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            term: listen(SignalKind::terminate())?,
            int: listen(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next termination signal
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.term.recv() => Signal::SIGTERM,
            _ = self.int.recv() => Signal::SIGINT,
        }
    }

    /// Cancel `token` on the first signal and return that signal
    pub fn watch(mut self, token: CancellationToken) -> JoinHandle<Signal> {
        tokio::spawn(async move {
            let received = self.recv().await;
            tracing::info!(signal = %received, "shutdown requested");
            token.cancel();
            received
        })
    }
}

/// Restore the default handler for `sig` and raise it against this process
///
/// # Errors
///
/// Returns error if the disposition cannot be changed or the signal raised
pub fn reraise(sig: Signal) -> nix::Result<()> {
    // SAFETY: SigDfl installs no Rust code as a handler.
    unsafe { signal::signal(sig, SigHandler::SigDfl) }?;
    signal::raise(sig)
}
