//! Interactive process driver.
//!
//! The command runs as a session leader with a pseudo-terminal as its
//! controlling terminal, so `ssh`, `sudo` and `borg` prompt on it as they
//! would for a person. Output is read off the master side on a dedicated
//! thread and fed to the capture; every chunk is matched against the prompt
//! table and the first matching answer is typed back.
//!
//! Three expiries race the process: a hard timeout, an idle timeout reset
//! by every output chunk, and a cancel check polled at a fixed interval.
//! Cancellation latency is therefore bounded by the poll interval. The
//! first expiry to fire terminates the whole process group, `SIGTERM`
//! first and `SIGKILL` after the grace period.

use async_trait::async_trait;
use bastion_log::OutputCapture;
use bastion_tool::Prompt;
use nix::pty::openpty;
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use zeroize::Zeroizing;

/// Bytes of recent output kept for prompt matching
const PROMPT_WINDOW: usize = 2048;

/// How long to keep draining output after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Argument vector, program first
    pub argv: Vec<String>,
    /// Environment additions
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Prompt table, first match wins
    pub prompts: Vec<Prompt>,
}

/// Expiry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Hard wall-clock limit
    pub timeout: Option<Duration>,
    /// Limit on time without output
    pub idle_timeout: Option<Duration>,
    /// Cancel check interval
    pub cancel_poll: Duration,
    /// SIGTERM to SIGKILL grace period
    pub kill_grace: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            timeout: None,
            idle_timeout: None,
            cancel_poll: Duration::from_secs(1),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Cooperative cancellation check
#[async_trait]
pub trait CancelCheck: Send + Sync {
    /// Whether cancellation was requested
    async fn is_cancelled(&self) -> bool;
}

/// Check that never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancel;

#[async_trait]
impl CancelCheck for NeverCancel {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Which expiry ended the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Hard timeout
    Timeout(Duration),
    /// No output for the idle timeout
    IdleTimeout(Duration),
    /// Cancel check fired
    Canceled,
}

impl std::fmt::Display for Expiry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(limit) => write!(f, "timeout after {}s", limit.as_secs()),
            Self::IdleTimeout(limit) => {
                write!(f, "idle timeout, no output for {}s", limit.as_secs())
            }
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// How the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// Expiry that terminated the process
    pub expiry: Option<Expiry>,
    /// Prompts answered
    pub answered: usize,
}

impl ProcessExit {
    fn from_status(status: ExitStatus, expiry: Option<Expiry>, answered: usize) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            expiry,
            answered,
        }
    }

    /// Exit code zero and no expiry
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0) && self.expiry.is_none()
    }
}

fn disable_echo(fd: &OwnedFd) -> io::Result<()> {
    let mut attrs = termios::tcgetattr(fd).map_err(io::Error::from)?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(io::Error::from)
}

fn spawn_on_pty(spec: &ProcessSpec) -> io::Result<(Child, File)> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;
    let pty = openpty(None, None).map_err(io::Error::from)?;
    // Answers typed into the terminal must not come back as output.
    disable_echo(&pty.slave)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&spec.env)
        .stdin(Stdio::from(pty.slave.try_clone()?))
        .stdout(Stdio::from(pty.slave.try_clone()?))
        .stderr(Stdio::from(pty.slave))
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn()?;
    Ok((child, File::from(pty.master)))
}

fn start_reader(mut master: File) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    let spawned = std::thread::Builder::new()
        .name("bastion-pty-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match master.read(&mut buf) {
                    // EIO once every slave descriptor is closed.
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    if let Err(err) = spawned {
        tracing::error!(error = %err, "failed to start pty reader");
    }
    rx
}

fn answer_prompt(prompts: &[Prompt], window: &mut String, terminal: &mut File) -> bool {
    let Some(prompt) = prompts.iter().find(|p| p.pattern.is_match(window)) else {
        return false;
    };
    let mut line = Zeroizing::new(prompt.answer.expose().as_bytes().to_vec());
    line.push(b'\n');
    if let Err(err) = terminal.write_all(&line).and_then(|()| terminal.flush()) {
        tracing::warn!(error = %err, "failed to answer prompt");
    }
    window.clear();
    true
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => tracing::warn!(pid, %signal, error = %err, "killpg failed"),
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let pid = child.id();
    signal_group(pid, Signal::SIGTERM);
    match timeout(grace, child.wait()).await {
        Ok(status) => {
            // Stragglers that ignored SIGTERM.
            signal_group(pid, Signal::SIGKILL);
            status
        }
        Err(_) => {
            signal_group(pid, Signal::SIGKILL);
            child.wait().await
        }
    }
}

/// Run `spec` to completion, feeding output to `capture`
///
/// # Errors
///
/// Returns error if the terminal or the process cannot be set up
pub async fn run_interactive(
    spec: &ProcessSpec,
    limits: ProcessLimits,
    check: &dyn CancelCheck,
    capture: &mut OutputCapture,
) -> io::Result<ProcessExit> {
    let (mut child, master) = spawn_on_pty(spec)?;
    let mut terminal = master.try_clone()?;
    let mut output = start_reader(master);
    tracing::debug!(pid = ?child.id(), program = %spec.argv[0], "spawned");

    let started = Instant::now();
    let hard_deadline = limits.timeout.map(|limit| started + limit);
    let mut idle_deadline = limits.idle_timeout.map(|limit| started + limit);
    let mut cancel_tick = interval(limits.cancel_poll);
    cancel_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    cancel_tick.tick().await;

    let mut window = String::new();
    let mut answered = 0;
    let mut output_open = true;

    let (status, expiry) = loop {
        tokio::select! {
            chunk = output.recv(), if output_open => match chunk {
                Some(bytes) => {
                    capture.feed(&bytes);
                    if let Some(limit) = limits.idle_timeout {
                        idle_deadline = Some(Instant::now() + limit);
                    }
                    window.push_str(&String::from_utf8_lossy(&bytes));
                    if window.len() > PROMPT_WINDOW {
                        let mut cut = window.len() - PROMPT_WINDOW;
                        while !window.is_char_boundary(cut) {
                            cut += 1;
                        }
                        window.drain(..cut);
                    }
                    if answer_prompt(&spec.prompts, &mut window, &mut terminal) {
                        answered += 1;
                    }
                }
                None => output_open = false,
            },
            status = child.wait() => break (status?, None),
            () = sleep_until(hard_deadline.unwrap_or(started)), if hard_deadline.is_some() => {
                let limit = limits.timeout.unwrap_or_default();
                break (terminate(&mut child, limits.kill_grace).await?, Some(Expiry::Timeout(limit)));
            }
            () = sleep_until(idle_deadline.unwrap_or(started)), if idle_deadline.is_some() => {
                let limit = limits.idle_timeout.unwrap_or_default();
                break (terminate(&mut child, limits.kill_grace).await?, Some(Expiry::IdleTimeout(limit)));
            }
            _ = cancel_tick.tick() => {
                if check.is_cancelled().await {
                    break (terminate(&mut child, limits.kill_grace).await?, Some(Expiry::Canceled));
                }
            }
        }
    };

    // Output written just before exit is still in the pipe.
    while output_open {
        match timeout(DRAIN_TIMEOUT, output.recv()).await {
            Ok(Some(bytes)) => {
                capture.feed(&bytes);
            }
            Ok(None) | Err(_) => output_open = false,
        }
    }

    let exit = ProcessExit::from_status(status, expiry, answered);
    tracing::debug!(code = ?exit.code, signal = ?exit.signal, expiry = ?exit.expiry, "process ended");
    Ok(exit)
}
