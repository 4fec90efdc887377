//! BASTION CLI
//!
//! Operational entry point: the scheduler daemon, one-off job runs, the
//! event ingestion pipeline, and the launch/cancel actions.
//!
//! The job store admits one process at a time. `schedule` owns it for the
//! daemon's lifetime, runs the event pipeline in-process and listens on a
//! control socket; `launch`, `cancel` and `ingest` go through that socket
//! when a daemon answers and open the store themselves otherwise.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod settings;

use bastion_core::{JobId, PolicyId, TracingNotifier};
use bastion_ingest::{
    reraise, sink_channel, ChannelSink, IngestContext, IngestError, JsonLinesSource,
    PayloadSource, Pipeline, ShutdownSignals, SignalEscalation, StatsSnapshot,
};
use bastion_log::{EventSink, MemoryQueue};
use bastion_runtime::{
    handle_request, CancelOutcome, Context, ControlClient, ControlReply, ControlRequest,
    ControlServer, JobRunner, LocalDispatcher, Scheduler,
};
use bastion_storage::{FileLock, MemoryConfig, RedbStore, RetryPolicy};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use console::style;
use settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "bastion=info";

/// Payloads per request when forwarding events to the daemon
const FORWARD_BATCH: usize = 256;

#[derive(Parser)]
#[command(name = "bastion")]
#[command(about = "BASTION - backup job scheduler, executor and event pipeline", long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, env = "BASTION_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    /// Override `storage.path`
    #[arg(long, global = true)]
    storage: Option<PathBuf>,
    /// Override `storage.socket_path`
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon and execute admitted jobs
    Schedule {
        /// Run a single cycle, wait for its jobs and exit
        #[arg(long)]
        once: bool,
        /// Override `scheduler.max_concurrent_jobs`
        #[arg(long)]
        max_concurrent_jobs: Option<usize>,
    },
    /// Execute one job in the foreground
    RunJob {
        /// Job ID
        job_id: u64,
    },
    /// Persist events read as JSON lines
    Ingest {
        /// Input file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Override `ingest.workers`
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Expand a policy into job chains and queue them
    Launch {
        /// Policy ID
        policy_id: u64,
        /// Record the launch as scheduled rather than manual
        #[arg(long)]
        scheduled: bool,
    },
    /// Cancel a job
    Cancel {
        /// Job ID
        job_id: u64,
    },
}

fn init_tracing(settings: &Settings, json: bool) {
    let directive = settings.log_filter.as_deref().unwrap_or(DEFAULT_FILTER);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply_env()?;
    if let Some(path) = &cli.storage {
        settings.storage.path = path.clone();
    }
    if let Some(path) = &cli.socket {
        settings.storage.socket_path = path.clone();
    }
    match &cli.command {
        Commands::Schedule {
            max_concurrent_jobs: Some(cap),
            ..
        } => settings.scheduler.max_concurrent_jobs = Some(*cap),
        Commands::Ingest {
            workers: Some(workers),
            ..
        } => settings.ingest.workers = *workers,
        _ => {}
    }
    settings.sync_tool_timeouts();
    Ok(settings)
}

fn open_store(settings: &Settings) -> Result<Arc<RedbStore>> {
    let store = RedbStore::open(&settings.storage.path).wrap_err_with(|| {
        format!(
            "cannot open {}; a daemon not listening on {} may hold it",
            settings.storage.path.display(),
            settings.storage.socket_path.display()
        )
    })?;
    Ok(Arc::new(store))
}

/// Build the shared runtime context from settings
fn context(settings: &Settings, store: Arc<RedbStore>, sink: Arc<dyn EventSink>) -> Context {
    let inventory = settings.inventory.clone();
    let config = Arc::new(MemoryConfig::from_inventory(
        inventory.policies,
        inventory.clients,
        inventory.repositories,
    ));
    let retry = RetryPolicy::new(
        settings.storage.retry_attempts,
        settings.storage.retry_interval(),
    );
    Context::new(store, config, Arc::new(TracingNotifier), sink)
        .with_tool_settings(settings.tool.clone())
        .with_retry(retry)
}

fn ingest_context(store: Arc<RedbStore>) -> IngestContext {
    IngestContext {
        events: store.clone(),
        jobs: store,
        notifier: Arc::new(TracingNotifier),
        escalation: Arc::new(SignalEscalation),
    }
}

/// Event pipeline fed by the executors of this process
struct LocalPipeline {
    sink: Arc<ChannelSink>,
    task: JoinHandle<Result<StatsSnapshot, IngestError>>,
}

impl LocalPipeline {
    fn start(settings: &Settings, store: Arc<RedbStore>) -> Self {
        let (sink, source) = sink_channel();
        let pipeline = Pipeline::new(ingest_context(store), settings.ingest.clone());
        let task = tokio::spawn(async move { pipeline.run(source, CancellationToken::new()).await });
        Self {
            sink: Arc::new(sink),
            task,
        }
    }

    /// Stop accepting events and wait for the workers to drain
    async fn finish(self) -> Result<StatsSnapshot> {
        self.sink.close();
        let stats = self.task.await??;
        tracing::info!(
            persisted = stats.persisted,
            eof = stats.eof,
            dropped = stats.dropped(),
            "event pipeline drained"
        );
        Ok(stats)
    }
}

fn reply_error(reply: ControlReply) -> color_eyre::Report {
    match reply {
        ControlReply::Error { message } => eyre!(message),
        other => eyre!("unexpected reply: {:?}", other),
    }
}

/// Send `request` to the daemon, or apply it here when none answers
async fn control(settings: &Settings, request: ControlRequest) -> Result<ControlReply> {
    if let Some(mut client) = ControlClient::connect(&settings.storage.socket_path).await? {
        tracing::debug!(socket = %settings.storage.socket_path.display(), "sending request to daemon");
        return Ok(client.request(&request).await?);
    }
    let store = open_store(settings)?;
    // Launch and cancel emit no events.
    let ctx = context(settings, store, Arc::new(MemoryQueue::new()));
    Ok(handle_request(&ctx, request).await)
}

async fn schedule(settings: &Settings, once: bool) -> Result<()> {
    let store = open_store(settings)?;
    let events = LocalPipeline::start(settings, store.clone());
    let ctx = context(settings, store, events.sink.clone());
    let runner = JobRunner::new(ctx.clone(), settings.executor.clone());
    let dispatcher = Arc::new(LocalDispatcher::new(ctx.clone(), runner));
    let lock = Arc::new(FileLock::new(&settings.storage.lock_path));
    let scheduler = Scheduler::new(
        ctx.clone(),
        settings.scheduler.clone(),
        lock,
        dispatcher.clone(),
        dispatcher.clone(),
    );

    if once {
        let report = scheduler.schedule().await?;
        if report.skipped {
            println!("{} another scheduler holds the lock", style("skipped").yellow());
        } else {
            println!(
                "dispatched {:?}, deferred {:?}, failed {:?}",
                report.dispatched, report.deferred, report.failed
            );
        }
        dispatcher.shutdown().await;
        events.finish().await?;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let watcher = ShutdownSignals::install()?.watch(shutdown.clone());
    let server = ControlServer::bind(&settings.storage.socket_path, ctx).await?;
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    scheduler.run(shutdown).await;
    watcher.abort();
    serving.await?;
    tracing::info!(running = dispatcher.running(), "waiting for running jobs");
    dispatcher.shutdown().await;
    events.finish().await?;
    Ok(())
}

async fn run_job(settings: &Settings, job_id: u64) -> Result<()> {
    if ControlClient::connect(&settings.storage.socket_path).await?.is_some() {
        return Err(eyre!(
            "the scheduler daemon on {} owns the store and runs queued jobs itself",
            settings.storage.socket_path.display()
        ));
    }
    let store = open_store(settings)?;
    let events = LocalPipeline::start(settings, store.clone());
    let ctx = context(settings, store, events.sink.clone());
    let runner = JobRunner::new(ctx, settings.executor.clone());
    let result = runner.run(JobId::new(job_id)).await;
    events.finish().await?;
    result?;
    println!("{} job {}", style("finished").green(), job_id);
    Ok(())
}

async fn input_source(
    input: Option<PathBuf>,
) -> Result<JsonLinesSource<BufReader<Box<dyn AsyncRead + Unpin + Send>>>> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = match input {
        Some(path) => Box::new(
            tokio::fs::File::open(&path)
                .await
                .wrap_err_with(|| format!("cannot open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    Ok(JsonLinesSource::new(BufReader::new(reader)))
}

/// Hand every payload of `source` to the daemon in batches
async fn forward_events<S: PayloadSource>(client: &mut ControlClient, mut source: S) -> Result<usize> {
    let mut forwarded = 0;
    let mut batch = Vec::with_capacity(FORWARD_BATCH);
    loop {
        let next = source.next_payload().await;
        let done = next.is_none();
        batch.extend(next);
        if batch.len() >= FORWARD_BATCH || (done && !batch.is_empty()) {
            let payloads = std::mem::take(&mut batch);
            match client.request(&ControlRequest::Events { payloads }).await? {
                ControlReply::Accepted { count } => forwarded += count,
                reply => return Err(reply_error(reply)),
            }
        }
        if done {
            return Ok(forwarded);
        }
    }
}

async fn ingest(settings: &Settings, input: Option<PathBuf>) -> Result<()> {
    let source = input_source(input).await?;
    if let Some(mut client) = ControlClient::connect(&settings.storage.socket_path).await? {
        let forwarded = forward_events(&mut client, source).await?;
        println!("{} {} payloads to the scheduler daemon", style("forwarded").green(), forwarded);
        return Ok(());
    }

    let store = open_store(settings)?;
    let pipeline = Pipeline::new(ingest_context(store), settings.ingest.clone());
    let shutdown = CancellationToken::new();
    let watcher = ShutdownSignals::install()?.watch(shutdown.clone());
    let result = pipeline.run(source, shutdown.clone()).await;

    // An escalation signals this process; let the watcher observe it.
    let signaled = shutdown.is_cancelled() || matches!(result, Err(IngestError::Escalated { .. }));
    if signaled {
        if let Ok(Ok(sig)) = tokio::time::timeout(Duration::from_secs(5), watcher).await {
            reraise(sig)?;
        }
    } else {
        watcher.abort();
    }

    let stats = result?;
    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

async fn launch(settings: &Settings, policy_id: u64, scheduled: bool) -> Result<()> {
    let request = ControlRequest::Launch {
        policy_id: PolicyId::new(policy_id),
        scheduled,
    };
    match control(settings, request).await? {
        ControlReply::Queued { job_ids } => {
            let ids: Vec<String> = job_ids.iter().map(ToString::to_string).collect();
            println!("{} {}", style("queued").green(), ids.join(", "));
            Ok(())
        }
        reply => Err(reply_error(reply)),
    }
}

async fn cancel(settings: &Settings, job_id: u64) -> Result<()> {
    let request = ControlRequest::Cancel {
        job_id: JobId::new(job_id),
    };
    let outcome = match control(settings, request).await? {
        ControlReply::Canceled { outcome } => outcome,
        reply => return Err(reply_error(reply)),
    };
    let message = match outcome {
        CancelOutcome::Canceled => style("canceled").green(),
        CancelOutcome::Requested => style("cancel requested").yellow(),
        CancelOutcome::AlreadyFinished => style("already finished").dim(),
    };
    println!("job {}: {}", job_id, message);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_tracing(&settings, cli.log_json);

    match cli.command {
        Commands::Schedule { once, .. } => schedule(&settings, once).await,
        Commands::RunJob { job_id } => run_job(&settings, job_id).await,
        Commands::Ingest { input, .. } => ingest(&settings, input).await,
        Commands::Launch {
            policy_id,
            scheduled,
        } => launch(&settings, policy_id, scheduled).await,
        Commands::Cancel { job_id } => cancel(&settings, job_id).await,
    }
}
