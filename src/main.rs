use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::Serialized;
use podvault::core::notifications::create_notifier;
use podvault::core::transfer_engine::TransferEngineType;
use podvault::core::{JobState, ProgressTracker, Restorer, RunSummary};
use podvault::{adapters, config::AppConfig, context::AppContext, core::Orchestrator, logging};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "podvault")]
#[command(about = "Back up and restore data directories of Kubernetes pods via object storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./podvault.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated exec channel and in-memory store
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Flush, archive and ship every configured pod
    Backup(BackupArgs),
    /// Fetch an archive from the bucket into every configured pod and load it
    Restore(RestoreArgs),
    /// Print the effective configuration with secrets redacted
    Config(BackupArgs),
}

#[derive(Args, Serialize, Default)]
struct BackupArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long)]
    namespace: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", rename = "pods")]
    #[arg(short, long = "pod", value_delimiter = ',')]
    pod: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", rename = "containers")]
    #[arg(short, long = "container", value_delimiter = ',')]
    container: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    remote_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long)]
    out_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    local_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short = 'm', long)]
    cluster_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    strategy: Option<TransferEngineType>,

    /// Bytes per download chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Bytes per upload part (defaults to the chunk size)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    part_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    expiry_days: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    upload: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verify: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    keep_local: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    keep_remote: Option<bool>,

    #[serde(skip)]
    #[arg(short, long)]
    bucket: Option<String>,

    #[serde(skip)]
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Args)]
struct RestoreArgs {
    #[command(flatten)]
    common: BackupArgs,

    /// Object key of the archive to restore
    #[arg(short, long)]
    file: String,

    /// Directory inside the container to unpack into
    #[arg(long)]
    extract_dir: Option<String>,
}

impl RestoreArgs {
    fn nested(&self) -> Figment {
        let mut figment = self
            .common
            .nested()
            .merge(Serialized::default("restore.archive", &self.file));
        if let Some(dir) = &self.extract_dir {
            figment = figment.merge(Serialized::default("restore.extract_dir", dir));
        }
        figment
    }
}

impl BackupArgs {
    /// Flags that land in nested config tables.
    fn nested(&self) -> Figment {
        let mut figment = Figment::new();
        if let Some(bucket) = &self.bucket {
            figment = figment.merge(Serialized::default("storage.bucket", bucket));
        }
        if let Some(endpoint) = &self.endpoint {
            figment = figment.merge(Serialized::default("storage.endpoint", endpoint));
        }
        figment
    }
}

fn layered(cli: &Cli, args: &BackupArgs, nested: Figment) -> Result<Figment> {
    let mut figment = AppConfig::figment(cli.config.as_deref())?
        .merge(Serialized::defaults(args))
        .merge(nested);
    if let Some(simulation) = cli.simulation {
        figment = figment.merge(Serialized::default("simulation", simulation));
    }
    if cli.verbose {
        figment = figment.merge(Serialized::default("log.verbose", true));
    }
    if cli.json {
        figment = figment.merge(Serialized::default("log.json", true));
    }
    Ok(figment)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Backup(args) => {
            let config = AppConfig::from_figment(layered(&cli, args, args.nested())?)?;
            logging::init(logging::LogConfig::from(&config.log))?;
            run_backup(config).await.context("Backup run failed")
        }
        Commands::Restore(args) => {
            let config = AppConfig::from_figment(layered(&cli, &args.common, args.nested())?)?;
            config.validate_restore()?;
            logging::init(logging::LogConfig::from(&config.log))?;
            run_restore(config).await.context("Restore run failed")
        }
        Commands::Config(args) => {
            // Incomplete configs are printed too.
            let config = AppConfig::extract(layered(&cli, args, args.nested())?)?;
            print!("{}", config.redacted().to_toml()?);
            if let Err(e) = config.validate() {
                eprintln!("Configuration is not runnable: {e:#}");
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn context(config: AppConfig) -> Result<AppContext> {
    let notifier = create_notifier(&config.notification, config.cluster_name.as_deref());
    let channel = adapters::get_channel(&config);
    let store = adapters::get_store(&config)
        .await
        .context("Failed to set up object store")?;
    Ok(AppContext::new(config, channel, store).with_notifier(notifier))
}

async fn run_backup(config: AppConfig) -> Result<ExitCode> {
    let ctx = context(config).await?;
    let progress = ctx.progress.clone();
    let orchestrator = Orchestrator::new(ctx);
    let jobs = orchestrator.plan().context("Failed to plan backup jobs")?;

    let shutdown = cancel_on_ctrl_c();
    let status = watch_progress(progress, &shutdown);
    let summary = orchestrator.run(jobs, &shutdown).await;
    status.cancel();
    Ok(finish(&summary, "Backup stored", "Backup failed"))
}

async fn run_restore(config: AppConfig) -> Result<ExitCode> {
    let ctx = context(config).await?;
    let progress = ctx.progress.clone();
    let restorer = Restorer::new(ctx);
    let jobs = restorer.plan().context("Failed to plan restore jobs")?;

    let shutdown = cancel_on_ctrl_c();
    let status = watch_progress(progress, &shutdown);
    let summary = restorer.run(jobs, &shutdown).await;
    status.cancel();
    Ok(finish(&summary, "Archive restored", "Restore failed"))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running jobs");
            on_signal.cancel();
        }
    });
    shutdown
}

/// Log which step every unfinished job is in until the returned token is
/// cancelled.
fn watch_progress(progress: ProgressTracker, shutdown: &CancellationToken) -> CancellationToken {
    let stop = shutdown.child_token();
    let token = stop.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let unfinished = progress.unfinished().await;
            if unfinished == 0 {
                continue;
            }
            info!(unfinished, "Jobs still running");
            for (job_id, job) in progress.snapshot().await {
                match job.state {
                    JobState::Running { step } => {
                        info!(%job_id, %step, transfer = ?job.transfer, "Job status")
                    }
                    JobState::Pending => info!(%job_id, "Job waiting"),
                    _ => {}
                }
            }
        }
    });
    stop
}

fn finish(summary: &RunSummary, stored: &str, failed: &str) -> ExitCode {
    for report in &summary.reports {
        match &report.location {
            Some(location) if report.succeeded() => {
                info!(pod = %report.target.pod, %location, "{stored}")
            }
            _ => error!(
                pod = %report.target.pod,
                state = ?report.state,
                last_transfer = ?report.last_transfer,
                "{failed}"
            ),
        }
    }

    if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
