//! Control socket of the scheduler daemon.
//!
//! The daemon owns the job store; other processes reach it through a Unix
//! socket speaking newline-delimited JSON, one reply per request. Launches,
//! cancellations and event batches are applied with the daemon's own
//! [`Context`], so they take effect while the scheduler runs.

use crate::cancel::{cancel_job, CancelOutcome};
use crate::context::Context;
use crate::launch::launch_policy;
use bastion_core::{JobId, LaunchType, PolicyId};
use bastion_log::QueuePayload;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Request sent to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Expand a policy and queue its chains
    Launch {
        /// Policy to launch
        policy_id: PolicyId,
        /// Record the launch as scheduled rather than manual
        #[serde(default)]
        scheduled: bool,
    },
    /// Cancel a job
    Cancel {
        /// Job to cancel
        job_id: JobId,
    },
    /// Hand payloads to the daemon's event pipeline
    Events {
        /// Payloads in producer order
        payloads: Vec<QueuePayload>,
    },
}

/// Reply from the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    /// Jobs created by a launch
    Queued {
        /// Created job ids, chain by chain
        job_ids: Vec<JobId>,
    },
    /// What a cancel did
    Canceled {
        /// Outcome of the request
        outcome: CancelOutcome,
    },
    /// Payloads handed to the pipeline
    Accepted {
        /// Number of payloads
        count: usize,
    },
    /// The request failed
    Error {
        /// Rendered error
        message: String,
    },
}

/// Apply one request with the daemon's context
pub async fn handle_request(ctx: &Context, request: ControlRequest) -> ControlReply {
    match request {
        ControlRequest::Launch {
            policy_id,
            scheduled,
        } => {
            let launch_type = if scheduled {
                LaunchType::Scheduled
            } else {
                LaunchType::Manual
            };
            match launch_policy(ctx, policy_id, launch_type).await {
                Ok(job_ids) => ControlReply::Queued { job_ids },
                Err(err) => ControlReply::Error {
                    message: err.to_string(),
                },
            }
        }
        ControlRequest::Cancel { job_id } => match cancel_job(ctx, job_id).await {
            Ok(outcome) => ControlReply::Canceled { outcome },
            Err(err) => ControlReply::Error {
                message: err.to_string(),
            },
        },
        ControlRequest::Events { payloads } => {
            let count = payloads.len();
            for payload in payloads {
                ctx.sink.emit(payload);
            }
            ControlReply::Accepted { count }
        }
    }
}

/// Listening side of the control socket
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    ctx: Context,
}

impl ControlServer {
    /// Bind the socket at `path`
    ///
    /// A socket file nobody answers on is left over from a dead daemon and
    /// is replaced.
    ///
    /// # Errors
    ///
    /// Returns `AddrInUse` if another daemon answers on `path`, or the bind
    /// error
    pub async fn bind(path: impl AsRef<Path>, ctx: Context) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if UnixStream::connect(&path).await.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("a daemon already listens on {}", path.display()),
            ));
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale control socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path,
            ctx,
        })
    }

    /// Socket path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires, then remove the socket
    pub async fn serve(self, shutdown: CancellationToken) {
        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let ctx = self.ctx.clone();
                        let stop = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(err) = serve_connection(stream, &ctx, stop).await {
                                tracing::debug!(error = %err, "control connection ended");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "control accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        connections.close();
        connections.wait().await;
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!(path = %self.path.display(), error = %err, "cannot remove control socket");
        }
        tracing::info!("control socket closed");
    }
}

async fn serve_connection(
    stream: UnixStream,
    ctx: &Context,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => handle_request(ctx, request).await,
            Err(err) => ControlReply::Error {
                message: format!("malformed request: {}", err),
            },
        };
        write_line(&mut write, &reply).await?;
    }
}

async fn write_line<T: Serialize>(write: &mut OwnedWriteHalf, value: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(value).map_err(io::Error::other)?;
    line.push(b'\n');
    write.write_all(&line).await?;
    write.flush().await
}

/// Connection to a running daemon
#[derive(Debug)]
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect to the daemon at `path`
    ///
    /// Returns `None` when no daemon listens there.
    ///
    /// # Errors
    ///
    /// Returns any other connect error
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Option<Self>> {
        match UnixStream::connect(path.as_ref()).await {
            Ok(stream) => {
                let (read, write) = stream.into_split();
                Ok(Some(Self {
                    lines: BufReader::new(read).lines(),
                    write,
                }))
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Send one request and wait for its reply
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails or the reply is malformed
    pub async fn request(&mut self, request: &ControlRequest) -> io::Result<ControlReply> {
        write_line(&mut self.write, request).await?;
        let line = self.lines.next_line().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed the connection")
        })?;
        serde_json::from_str(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::World;
    use crate::dispatch::RecordingDispatcher;
    use crate::scheduler::Scheduler;
    use crate::settings::SchedulerSettings;
    use bastion_core::JobStatus;
    use bastion_storage::{JobStore, LocalLock};
    use std::sync::Arc;

    async fn dispatched(recorder: &RecordingDispatcher) -> Vec<JobId> {
        for _ in 0..200 {
            let ids = recorder.job_ids();
            if !ids.is_empty() {
                return ids;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler dispatched nothing");
    }

    #[tokio::test]
    async fn test_launch_and_cancel_while_scheduler_runs() {
        let world = World::new();
        world.prepared(100);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.sock");

        let recorder = Arc::new(RecordingDispatcher::new());
        let scheduler = Scheduler::new(
            world.ctx.clone(),
            SchedulerSettings::default(),
            Arc::new(LocalLock::new()),
            recorder.clone(),
            recorder.clone(),
        );
        let shutdown = CancellationToken::new();
        let scheduling = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });
        let server = ControlServer::bind(&path, world.ctx.clone()).await.unwrap();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        let mut client = ControlClient::connect(&path).await.unwrap().unwrap();
        let reply = client
            .request(&ControlRequest::Launch {
                policy_id: PolicyId::new(1),
                scheduled: false,
            })
            .await
            .unwrap();
        let ControlReply::Queued { job_ids } = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert_eq!(job_ids.len(), 6);

        // The launch woke the running scheduler.
        let started = dispatched(&recorder).await[0];
        let reply = client
            .request(&ControlRequest::Cancel { job_id: started })
            .await
            .unwrap();
        assert_eq!(
            reply,
            ControlReply::Canceled {
                outcome: CancelOutcome::Requested
            }
        );
        assert!(world.store.get_job(started).await.unwrap().cancel_flag);

        let queued = *job_ids.last().unwrap();
        let reply = client
            .request(&ControlRequest::Cancel { job_id: queued })
            .await
            .unwrap();
        assert_eq!(
            reply,
            ControlReply::Canceled {
                outcome: CancelOutcome::Canceled
            }
        );
        assert_eq!(
            world.store.get_job(queued).await.unwrap().status,
            JobStatus::Canceled
        );

        shutdown.cancel();
        scheduling.await.unwrap();
        serving.await.unwrap();
        assert!(!path.exists());
        assert!(!recorder.job_ids().contains(&queued));
    }

    #[tokio::test]
    async fn test_events_reach_the_daemon_sink() {
        let world = World::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.sock");
        let server = ControlServer::bind(&path, world.ctx.clone()).await.unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        let mut client = ControlClient::connect(&path).await.unwrap().unwrap();
        let payloads = vec![
            QueuePayload::catalog(JobId::new(7), "blob".into()),
            QueuePayload::eof(JobId::new(7), 1, None),
        ];
        let reply = client
            .request(&ControlRequest::Events { payloads })
            .await
            .unwrap();
        assert_eq!(reply, ControlReply::Accepted { count: 2 });
        assert!(world.queue.payloads()[1].is_eof());

        shutdown.cancel();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_policy_and_malformed_lines_get_error_replies() {
        let world = World::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.sock");
        let server = ControlServer::bind(&path, world.ctx.clone()).await.unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        let mut client = ControlClient::connect(&path).await.unwrap().unwrap();
        let reply = client
            .request(&ControlRequest::Launch {
                policy_id: PolicyId::new(99),
                scheduled: true,
            })
            .await
            .unwrap();
        assert!(matches!(reply, ControlReply::Error { .. }));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"not json\n").await.unwrap();
        let line = BufReader::new(read).lines().next_line().await.unwrap().unwrap();
        let reply: ControlReply = serde_json::from_str(&line).unwrap();
        assert!(matches!(reply, ControlReply::Error { message } if message.starts_with("malformed request")));

        shutdown.cancel();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_refuses_live_daemon_and_replaces_stale_socket() {
        let world = World::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.sock");

        let live = ControlServer::bind(&path, world.ctx.clone()).await.unwrap();
        let err = ControlServer::bind(&path, world.ctx.clone()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        // Dropping the listener leaves the file behind.
        drop(live);
        assert!(path.exists());
        assert!(ControlClient::connect(&path).await.unwrap().is_none());
        let replaced = ControlServer::bind(&path, world.ctx.clone()).await.unwrap();
        assert_eq!(replaced.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_connect_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::connect(dir.path().join("missing.sock")).await.unwrap();
        assert!(client.is_none());
    }
}
