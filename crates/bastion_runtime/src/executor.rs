//! Job runner.
//!
//! Runs one job from `running` to a terminal status. Whatever happens in
//! between, the scratch directory is removed, the output capture is closed
//! (so the pipeline sees the end-of-stream sentinel) and the final status is
//! persisted and published.
//!
//! Failure classes: anything until the command line is built and staged
//! is a setup error (`error`). A failed pre-run hook, a command that cannot
//! be spawned, a non-zero exit or an expired timeout is `failed`. An
//! observed cancel flag is `canceled`.

use crate::context::Context;
use crate::error::{RuntimeError, RuntimeResult};
use crate::hooks::{self, HookError};
use crate::outcome::{RunOutcome, TaskError};
use crate::process::{self, CancelCheck, Expiry, ProcessExit, ProcessLimits, ProcessSpec};
use crate::settings::ExecutorSettings;
use crate::staging::Scratch;
use async_trait::async_trait;
use bastion_core::{Client, Credentials, Job, JobId, JobStatus, JobUpdate, Policy, Repository};
use bastion_log::OutputCapture;
use bastion_policy::Redactor;
use bastion_storage::{JobStore, StoreError, StoreResult};
use bastion_tool::{wrap_with_agent, BuildContext, TunnelLease};
use std::io;
use std::sync::Arc;

/// Configuration records a job refers to
#[derive(Debug, Default)]
struct Loaded {
    policy: Option<Policy>,
    client: Option<Client>,
    hypervisor: Option<Client>,
    repository: Option<Repository>,
}

impl Loaded {
    fn credentials(&self) -> impl Iterator<Item = &Credentials> {
        [self.client.as_ref(), self.hypervisor.as_ref()]
            .into_iter()
            .flatten()
            .map(|c| &c.credentials)
            .chain(self.repository.as_ref().map(|r| &r.credentials))
    }
}

/// Re-reads the cancel flag from the job store
struct StoredCancelFlag {
    jobs: Arc<dyn JobStore>,
    job: JobId,
}

#[async_trait]
impl CancelCheck for StoredCancelFlag {
    async fn is_cancelled(&self) -> bool {
        match self.jobs.get_job(self.job).await {
            Ok(job) => job.cancel_flag,
            Err(err) => {
                tracing::warn!(job_id = %self.job, error = %err, "cancel check failed");
                false
            }
        }
    }
}

struct Finished {
    job: Job,
    outcome: RunOutcome,
    traceback: Option<String>,
}

/// Runs jobs
#[derive(Debug, Clone)]
pub struct JobRunner {
    ctx: Context,
    settings: Arc<ExecutorSettings>,
}

impl JobRunner {
    /// Create a runner
    #[must_use]
    pub fn new(ctx: Context, settings: ExecutorSettings) -> Self {
        Self {
            ctx,
            settings: Arc::new(settings),
        }
    }

    /// Runner settings
    #[must_use]
    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run job `id` to completion
    ///
    /// Jobs that are already terminal are left alone.
    ///
    /// # Errors
    ///
    /// Returns error for every outcome but success, so the caller can
    /// cascade the failure
    pub async fn run(&self, id: JobId) -> Result<(), TaskError> {
        let job = self.ctx.jobs.get_job(id).await.map_err(|e| storage(id, &e))?;
        if job.is_terminal() {
            tracing::debug!(job_id = %id, status = %job.status, "job already finished");
            return Ok(());
        }
        let job = self
            .ctx
            .update(id, &JobUpdate::status(JobStatus::Running))
            .await
            .map_err(|e| storage(id, &e))?;
        tracing::info!(job_id = %id, job_type = %job.job_type, "job running");

        let uuid = job.celery_task_id.map(|c| c.to_string());
        let mut capture = OutputCapture::new(id, uuid, self.ctx.sink.clone());
        let finished = self.execute(job, &mut capture).await;
        self.finalize(finished, &mut capture).await
    }

    async fn execute(&self, job: Job, capture: &mut OutputCapture) -> Finished {
        let loaded = match self.load(&job).await {
            Ok(loaded) => loaded,
            Err(err) => return self.setup_failure(job, err.into()),
        };

        let job = match hooks::before_run(&self.ctx, job.clone(), loaded.client.as_ref()).await {
            Ok(job) => job,
            Err(HookError::Unresolved(reason)) => {
                tracing::warn!(job_id = %job.id, %reason, "pre-run hook failed");
                return Finished {
                    job,
                    outcome: RunOutcome::Failed { rc: None, reason },
                    traceback: None,
                };
            }
            Err(HookError::Store(err)) => return self.setup_failure(job, err.into()),
        };

        match self.ctx.jobs.get_job(job.id).await {
            Ok(current) if current.cancel_flag => {
                tracing::info!(job_id = %job.id, "canceled before start");
                return Finished {
                    job,
                    outcome: RunOutcome::Canceled { rc: None },
                    traceback: None,
                };
            }
            Ok(_) => {}
            Err(err) => return self.setup_failure(job, err.into()),
        }

        let mut scratch = match Scratch::create(self.settings.scratch_root.as_deref()) {
            Ok(scratch) => scratch,
            Err(err) => return self.setup_failure(job, RuntimeError::io("creating scratch directory", err)),
        };
        let result = self.spawn_in(&job, &loaded, &mut scratch, capture).await;
        if let Err(err) = scratch.close() {
            tracing::warn!(job_id = %job.id, error = %err, "failed to remove scratch directory");
        }

        match result {
            Ok(outcome) => Finished {
                job,
                outcome,
                traceback: None,
            },
            Err(err) => self.setup_failure(job, err),
        }
    }

    async fn load(&self, job: &Job) -> StoreResult<Loaded> {
        let config = &self.ctx.config;
        let mut loaded = Loaded::default();
        if let Some(id) = job.policy_id {
            loaded.policy = Some(config.policy(id).await?);
        }
        if let Some(id) = job.client_id {
            let client = config.client(id).await?;
            if let Some(hypervisor) = client.hypervisor_id {
                loaded.hypervisor = Some(config.client(hypervisor).await?);
            }
            loaded.client = Some(client);
        }
        if let Some(id) = job.repository_id {
            loaded.repository = Some(config.repository(id).await?);
        }
        Ok(loaded)
    }

    async fn spawn_in(
        &self,
        job: &Job,
        loaded: &Loaded,
        scratch: &mut Scratch,
        capture: &mut OutputCapture,
    ) -> RuntimeResult<RunOutcome> {
        let builder = self.ctx.builders.get(job.job_type)?;
        let dir = scratch.path().to_path_buf();
        let mut build = BuildContext::new(job, &dir, &self.ctx.tool);
        build.policy = loaded.policy.as_ref();
        build.client = loaded.client.as_ref();
        build.hypervisor = loaded.hypervisor.as_ref();
        build.repository = loaded.repository.as_ref();

        let tunnel = if builder.needs_tunnel(&build) {
            let lease = self
                .ctx
                .tunnels
                .lease(job.id.as_u64())
                .ok_or(RuntimeError::TunnelPortsExhausted)?;
            tracing::debug!(job_id = %job.id, port = lease.port(), "tunnel port leased");
            Some(lease)
        } else {
            None
        };
        build.tunnel_port = tunnel.as_ref().map(TunnelLease::port);

        let key = builder.ssh_key(&build);
        let staged = match key {
            Some((key, _)) => Some(
                scratch
                    .stage_secret("ssh_key", key)
                    .map_err(|e| RuntimeError::io("staging ssh key", e))?,
            ),
            None => None,
        };
        build.staged_key = staged.as_deref();

        let mut cmd = builder.build(&build)?;
        for file in &cmd.files {
            scratch
                .write_file(file)
                .map_err(|e| RuntimeError::io(format!("writing {}", file.name), e))?;
        }

        let redactor = self.redactor(&cmd.redactor(), loaded);
        cmd.redact_display(&redactor);
        let env = cmd.redacted_env(&redactor);
        self.ctx
            .update(
                job.id,
                &JobUpdate::default().with_launch_context(
                    cmd.display_argv.clone(),
                    dir.display().to_string(),
                    env,
                ),
            )
            .await?;

        if let (Some(path), Some((_, passphrase))) = (&staged, key) {
            wrap_with_agent(&mut cmd, path, passphrase).map_err(|e| {
                RuntimeError::io("preparing ssh-agent", io::Error::new(io::ErrorKind::InvalidInput, e))
            })?;
        }

        let spec = ProcessSpec {
            argv: cmd.argv,
            env: cmd.env,
            cwd: Some(dir.clone()),
            prompts: cmd.prompts,
        };
        let limits = ProcessLimits {
            timeout: self
                .settings
                .timeout(loaded.policy.as_ref().and_then(|p| p.timeout_secs)),
            idle_timeout: self.settings.idle_timeout(),
            cancel_poll: self.settings.cancel_poll_interval(),
            kill_grace: self.settings.kill_grace(),
        };
        let check = StoredCancelFlag {
            jobs: self.ctx.jobs.clone(),
            job: job.id,
        };
        tracing::info!(job_id = %job.id, argv = ?redactor.redact_args(&spec.argv), "spawning");
        match process::run_interactive(&spec, limits, &check, capture).await {
            Ok(exit) => Ok(classify(&exit)),
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "command could not be run");
                Ok(RunOutcome::Failed {
                    rc: None,
                    reason: format!("Command could not be run: {}", err),
                })
            }
        }
    }

    fn redactor(&self, base: &Redactor, loaded: &Loaded) -> Redactor {
        let mut redactor = base.clone();
        for credentials in loaded.credentials() {
            let named = [
                &credentials.ssh_private_key,
                &credentials.ssh_key_passphrase,
                &credentials.ssh_password,
                &credentials.become_password,
                &credentials.repository_passphrase,
            ];
            for secret in named.into_iter().flatten().chain(credentials.extra.values()) {
                redactor.add_secret(secret);
            }
        }
        if let Some(token) = &self.ctx.tool.token {
            redactor.add_secret(token);
        }
        redactor
    }

    fn setup_failure(&self, job: Job, err: RuntimeError) -> Finished {
        tracing::error!(job_id = %job.id, error = %err, "job setup failed");
        let traceback = self.settings.debug_tracebacks.then(|| err.chain());
        Finished {
            job,
            outcome: RunOutcome::SetupError {
                cause: err.to_string(),
            },
            traceback,
        }
    }

    async fn finalize(&self, finished: Finished, capture: &mut OutputCapture) -> Result<(), TaskError> {
        let Finished {
            job,
            outcome,
            traceback,
        } = finished;
        hooks::after_run(&self.ctx, &job, &outcome).await;

        let events = capture.close();
        let mut update = JobUpdate::status_with_explanation(outcome.status(), outcome.explanation())
            .with_emitted_events(events);
        if let Some(traceback) = traceback {
            update = update.with_traceback(traceback);
        }
        match self.ctx.update(job.id, &update).await {
            Ok(done) => {
                tracing::info!(
                    job_id = %done.id,
                    status = %done.status,
                    events,
                    elapsed = ?done.elapsed,
                    "job finished"
                );
            }
            Err(StoreError::Rejected(err)) => {
                tracing::warn!(job_id = %job.id, error = %err, "job was finalized elsewhere");
            }
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "failed to persist final status");
                return Err(storage(job.id, &err));
            }
        }
        outcome.into_result(job.id)
    }
}

fn storage(job: JobId, err: &StoreError) -> TaskError {
    TaskError::Storage {
        job,
        reason: err.to_string(),
    }
}

fn classify(exit: &ProcessExit) -> RunOutcome {
    match exit.expiry {
        Some(Expiry::Canceled) => RunOutcome::Canceled { rc: exit.code },
        Some(expiry) => RunOutcome::Failed {
            rc: exit.code,
            reason: format!("Job terminated: {}", expiry),
        },
        None if exit.code == Some(0) => RunOutcome::Success,
        None => RunOutcome::Failed {
            rc: exit.code,
            reason: match (exit.code, exit.signal) {
                (Some(rc), _) => format!("Command exited with rc {}", rc),
                (None, Some(signal)) => format!("Command killed by signal {}", signal),
                (None, None) => "Command ended without an exit status".to_string(),
            },
        },
    }
}
