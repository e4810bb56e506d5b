//! Plans jobs from configuration and drives each through
//! flush → compress → transfer → cleanup.
//!
//! Jobs run concurrently and share nothing mutable except the progress
//! tracker, which is keyed by job id. A failing job never cancels another.

use std::collections::HashMap;
use std::future::Future;
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, FlushConfig};
use crate::context::AppContext;
use crate::core::models::{Job, JobIdentity, JobReport, JobState, StepError, Target};
use crate::core::notifications::JobEvent;
use crate::core::pipeline::{Step, run_steps};
use crate::core::remote::{RemoteCommand, RemoteCommandChannel, remote_join, validate_file_name};
use crate::core::transfer_engine::{
    TransferEngine, TransferRequest, TransferStatus, create_engine,
};
use crate::error::{Result, TransferError};
use crate::logging::LogThrottle;

/// Fixed wait after the flush command when no check is configured.
///
/// The flush CLI returns once the request is accepted, not once memtables
/// are on disk, and exposes no completion signal. Archiving earlier can
/// miss the newest data.
pub const FLUSH_SETTLE: Duration = Duration::from_secs(5);

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);
const ARCHIVE_TIMESTAMP: &str = "%Y%m%d%H%M%S";

/// One job per `(pod, container)`, all stamped with the same `now`.
pub fn plan_jobs(config: &AppConfig, now: DateTime<Local>) -> Result<Vec<Job>> {
    if config.pods.is_empty() {
        return Err(TransferError::InvalidArgument("no pods to back up".to_string()));
    }
    let chunk_size = NonZeroU64::new(config.chunk_size)
        .ok_or_else(|| TransferError::InvalidArgument("chunk_size must be > 0".to_string()))?;
    let part_size = NonZeroU64::new(config.part_size())
        .ok_or_else(|| TransferError::InvalidArgument("part_size must be > 0".to_string()))?;
    let concurrency = NonZeroUsize::new(config.concurrency)
        .ok_or_else(|| TransferError::InvalidArgument("concurrency must be >= 1".to_string()))?;
    let expiry = Duration::from_secs(u64::from(config.expiry_days) * 24 * 60 * 60);
    let stamp = now.format(ARCHIVE_TIMESTAMP).to_string();

    let mut jobs = Vec::with_capacity(config.pods.len() * config.containers.len());
    for pod in &config.pods {
        for container in &config.containers {
            let mut stem = match &config.out_name {
                Some(out) => format!("{out}_{pod}"),
                None => pod.clone(),
            };
            // Keep names unique when one pod has several containers.
            if config.containers.len() > 1 {
                stem = format!("{stem}_{container}");
            }
            let archive_name = format!("{stem}_{stamp}.tar.gz");
            validate_file_name(&archive_name)?;

            jobs.push(Job {
                id: Uuid::now_v7().to_string(),
                target: Target::new(&config.namespace, pod, container),
                data_dir: config.data_dir.clone(),
                remote_path: remote_join(&config.remote_dir, &archive_name),
                local_path: config.local_dir.join(&archive_name),
                object_key: archive_name.clone(),
                archive_name,
                chunk_size,
                part_size,
                concurrency,
                expiry,
                upload: config.upload,
                keep_local: config.keep_local,
                keep_remote: config.keep_remote,
                verify: config.verify,
            });
        }
    }
    Ok(jobs)
}

/// Reports of every job in one run, in planning order.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "millis")]
    pub duration: Duration,
    pub reports: Vec<JobReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }
}

fn millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

pub struct Orchestrator {
    ctx: AppContext,
    engine: Arc<dyn TransferEngine>,
}

impl Orchestrator {
    /// Uses the engine named by `config.strategy`.
    pub fn new(ctx: AppContext) -> Self {
        let engine = create_engine(ctx.config.strategy, &ctx);
        Self { ctx, engine }
    }

    pub fn with_engine(ctx: AppContext, engine: Arc<dyn TransferEngine>) -> Self {
        Self { ctx, engine }
    }

    pub fn plan(&self) -> Result<Vec<Job>> {
        plan_jobs(&self.ctx.config, Local::now())
    }

    /// Run every job to a terminal state.
    ///
    /// Cancelling `shutdown` cancels all jobs; nothing else crosses jobs.
    pub async fn run(&self, jobs: Vec<Job>, shutdown: &CancellationToken) -> RunSummary {
        info!(jobs = jobs.len(), strategy = self.engine.name(), "Starting backup run");
        let ctx = self.ctx.clone();
        let engine = self.engine.clone();
        run_jobs(&self.ctx, "backup", jobs, shutdown, move |job, cancel| {
            run_job(ctx.clone(), engine.clone(), job, cancel)
        })
        .await
    }
}

/// Spawn one task per job and collect every report, in planning order.
///
/// All jobs are published as `Pending` before the first one starts. A job
/// whose task dies gets a synthetic failed report.
pub(crate) async fn run_jobs<J, F, Fut>(
    ctx: &AppContext,
    operation: &'static str,
    jobs: Vec<J>,
    shutdown: &CancellationToken,
    start: F,
) -> RunSummary
where
    J: JobIdentity,
    F: Fn(Arc<J>, CancellationToken) -> Fut,
    Fut: Future<Output = JobReport> + Send + 'static,
{
    let started_at = Utc::now();
    let clock = Instant::now();
    for job in &jobs {
        ctx.progress.set_state(job.id(), JobState::Pending).await;
    }

    let mut tasks = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, (usize, Arc<J>)> = HashMap::new();
    for (index, job) in jobs.into_iter().enumerate() {
        let job = Arc::new(job);
        let handle = tasks.spawn(start(job.clone(), shutdown.child_token()));
        running.insert(handle.id(), (index, job));
    }

    let mut reports = Vec::with_capacity(running.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, report)) => {
                if let Some((index, _)) = running.remove(&id) {
                    reports.push((index, report));
                }
            }
            Err(join_err) => {
                if let Some((index, job)) = running.remove(&join_err.id()) {
                    error!(job_id = %job.id(), error = %join_err, "Job task died");
                    let report = crashed_report(job.as_ref(), &join_err);
                    ctx.progress.set_state(job.id(), report.state.clone()).await;
                    reports.push((index, report));
                }
            }
        }
    }
    reports.sort_by_key(|(index, _)| *index);

    let summary = RunSummary {
        started_at,
        finished_at: Utc::now(),
        duration: clock.elapsed(),
        reports: reports.into_iter().map(|(_, report)| report).collect(),
    };
    info!(
        operation,
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        duration_ms = summary.duration.as_millis() as u64,
        "Run finished"
    );
    summary
}

/// Attach the last engine status, log the outcome and notify.
///
/// Notification failures are logged and never change the report.
pub(crate) async fn finish_job(ctx: &AppContext, mut report: JobReport) -> JobReport {
    report.last_transfer = ctx
        .progress
        .get(&report.job_id)
        .await
        .and_then(|p| p.transfer);

    match &report.state {
        JobState::Succeeded => info!(
            location = report.location.as_deref().unwrap_or_default(),
            duration_ms = report.duration.as_millis() as u64,
            "Job succeeded"
        ),
        JobState::Failed { step, error } => {
            error!(step = %step, error = %error, "Job failed")
        }
        JobState::Pending | JobState::Running { .. } => {}
    }

    if let (Some(notifier), Some(event)) = (&ctx.notifier, JobEvent::from_report(&report)) {
        if let Err(e) = notifier.notify(event).await {
            warn!(error = %e, "Failed to send notification");
        }
    }
    report
}

async fn run_job(
    ctx: AppContext,
    engine: Arc<dyn TransferEngine>,
    job: Arc<Job>,
    cancel: CancellationToken,
) -> JobReport {
    let span = info_span!(
        "job",
        job_id = %job.id,
        pod = %job.target.pod,
        container = %job.target.container
    );

    async move {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(archive = %job.archive_name, "Job started");

        let mut location = None;
        let channel = ctx.channel.as_ref();
        let steps = vec![
            Step::new(
                "flush",
                flush(channel, &job.target, &ctx.config.flush, &cancel),
            ),
            Step::new("compress", compress(channel, &job, &cancel)),
            Step::new("transfer", async {
                location = Some(transfer(&ctx, engine.as_ref(), &job, &cancel).await?);
                Ok::<_, TransferError>(())
            }),
            Step::new("cleanup", cleanup(channel, &job)),
        ];
        let outcome = run_steps(&job.id, &ctx.progress, steps).await;

        let report = JobReport {
            job_id: job.id.clone(),
            target: job.target.clone(),
            archive_name: job.archive_name.clone(),
            state: outcome.state,
            steps: outcome.steps,
            started_at,
            duration: clock.elapsed(),
            location,
            last_transfer: None,
        };
        finish_job(&ctx, report).await
    }
    .instrument(span)
    .await
}

async fn flush(
    channel: &dyn RemoteCommandChannel,
    target: &Target,
    config: &FlushConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    if config.command.is_empty() {
        debug!("No flush command configured");
        return Ok(());
    }
    let command = RemoteCommand::from_argv(config.command.iter().cloned())?;
    cancellable(cancel, channel.run(target, &command)).await?;

    match &config.check {
        Some(check) => {
            let check = RemoteCommand::from_argv(check.iter().cloned())?;
            wait_for_check(channel, target, &check, config, cancel).await
        }
        None => {
            info!(
                settle_secs = config.settle_secs,
                "Waiting for flush to settle, completion is not verified"
            );
            sleep(cancel, Duration::from_secs(config.settle_secs)).await
        }
    }
}

/// Poll `check` until it exits zero. A non-zero exit means "not yet".
async fn wait_for_check(
    channel: &dyn RemoteCommandChannel,
    target: &Target,
    check: &RemoteCommand,
    config: &FlushConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let interval = Duration::from_secs(config.check_interval_secs);
    for attempt in 1..=config.check_attempts {
        match cancellable(cancel, channel.run(target, check)).await {
            Ok(_) => {
                debug!(attempt, "Flush confirmed by check");
                return Ok(());
            }
            Err(TransferError::Command { .. }) => {
                debug!(attempt, "Flush not confirmed yet");
            }
            Err(e) => return Err(e),
        }
        if attempt < config.check_attempts {
            sleep(cancel, interval).await?;
        }
    }
    Err(TransferError::Timeout {
        target: target.to_string(),
        command: check.to_string(),
        secs: config.check_interval_secs * u64::from(config.check_attempts),
    })
}

async fn compress(
    channel: &dyn RemoteCommandChannel,
    job: &Job,
    cancel: &CancellationToken,
) -> Result<()> {
    let command = RemoteCommand::archive(&job.remote_path, &job.data_dir)?;
    let output = cancellable(cancel, channel.run(&job.target, &command)).await?;
    if !output.stderr.is_empty() {
        debug!(stderr = %output.stderr_lossy().trim(), "tar wrote to stderr");
    }
    Ok(())
}

/// Run the engine, feeding its status updates into the tracker.
async fn transfer(
    ctx: &AppContext,
    engine: &dyn TransferEngine,
    job: &Arc<Job>,
    cancel: &CancellationToken,
) -> Result<String> {
    let (tx, mut rx) = mpsc::channel::<TransferStatus>(64);
    let tracker = ctx.progress.clone();
    let job_id = job.id.clone();

    let drain = tokio::spawn(
        async move {
            let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
            while let Some(status) = rx.recv().await {
                log_progress(&throttle, &status);
                tracker.update(&job_id, status).await;
            }
        }
        .instrument(Span::current()),
    );

    let request = TransferRequest {
        job: job.clone(),
        cancel: cancel.clone(),
    };
    let result = engine.transfer(&request, tx).await;
    // The engine future owned the sender, so the drain ends on its own.
    if let Err(e) = drain.await {
        warn!(error = %e, "Progress drain task failed");
    }

    let result = result?;
    info!(
        bytes = result.total_bytes,
        duration_ms = result.duration.as_millis() as u64,
        engine = engine.name(),
        "Transfer complete"
    );
    Ok(result.location)
}

fn log_progress(throttle: &LogThrottle, status: &TransferStatus) {
    if let TransferStatus::InProgress {
        phase,
        total_bytes,
        bytes_done,
        units_done,
        units_total,
        percentage,
    } = status
    {
        if *units_done == *units_total {
            throttle.reset();
        }
        if throttle.should_log() {
            info!(
                ?phase,
                bytes_done,
                total_bytes,
                units_done,
                units_total,
                percentage,
                "Transfer progress"
            );
        }
    }
}

async fn cleanup(channel: &dyn RemoteCommandChannel, job: &Job) -> Result<()> {
    if job.keep_remote {
        debug!(path = %job.remote_path, "Keeping remote archive");
        return Ok(());
    }
    let command = RemoteCommand::remove(&job.remote_path)?;
    channel.run(&job.target, &command).await?;
    Ok(())
}

pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        res = fut => res,
    }
}

async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    cancellable(cancel, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

fn crashed_report<J: JobIdentity>(job: &J, err: &JoinError) -> JobReport {
    JobReport {
        job_id: job.id().to_string(),
        target: job.target().clone(),
        archive_name: job.archive_name().to_string(),
        state: JobState::Failed {
            step: "job".to_string(),
            error: StepError {
                kind: "panic".to_string(),
                message: err.to_string(),
            },
        },
        steps: Vec::new(),
        started_at: Utc::now(),
        duration: Duration::ZERO,
        location: None,
        last_transfer: None,
    }
}
