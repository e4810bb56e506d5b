//! Restores an archive from the bucket into containers:
//! env_check → fetch → extract → load → cleanup.
//!
//! The bucket-to-container copy goes through the same in-container utility
//! the remote-tool strategy uploads with, so the archive never passes
//! through this host.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

use crate::config::{AppConfig, LoadConfig};
use crate::context::AppContext;
use crate::core::models::{JobReport, RestoreJob, Target};
use crate::core::orchestrator::{RunSummary, cancellable, finish_job, run_jobs};
use crate::core::pipeline::{Step, run_steps};
use crate::core::pool::run_bounded;
use crate::core::remote::{
    RemoteCommand, RemoteCommandChannel, remote_join, validate_file_name, validate_remote_path,
};
use crate::core::transfer_engine::RemoteToolEngine;
use crate::error::{Result, TransferError};

/// One restore job per `(pod, container)`, all for the same archive.
pub fn plan_restore(config: &AppConfig) -> Result<Vec<RestoreJob>> {
    if config.pods.is_empty() {
        return Err(TransferError::InvalidArgument("no pods to restore into".to_string()));
    }
    let archive = config
        .restore
        .archive
        .as_deref()
        .ok_or_else(|| TransferError::InvalidArgument("no archive to restore".to_string()))?;
    validate_file_name(archive)?;
    validate_remote_path(&config.restore.extract_dir)?;
    let concurrency = NonZeroUsize::new(config.concurrency)
        .ok_or_else(|| TransferError::InvalidArgument("concurrency must be >= 1".to_string()))?;

    let mut jobs = Vec::with_capacity(config.pods.len() * config.containers.len());
    for pod in &config.pods {
        for container in &config.containers {
            jobs.push(RestoreJob {
                id: Uuid::now_v7().to_string(),
                target: Target::new(&config.namespace, pod, container),
                object_key: archive.to_string(),
                remote_path: remote_join(&config.remote_dir, archive),
                extract_dir: config.restore.extract_dir.clone(),
                concurrency,
                keep_remote: config.keep_remote,
            });
        }
    }
    Ok(jobs)
}

pub struct Restorer {
    ctx: AppContext,
    tool: Arc<RemoteToolEngine>,
}

impl Restorer {
    pub fn new(ctx: AppContext) -> Self {
        let tool = Arc::new(RemoteToolEngine::new(
            ctx.channel.clone(),
            ctx.store.clone(),
            ctx.config.remote_tool.clone(),
            ctx.config.storage.clone(),
        ));
        Self { ctx, tool }
    }

    pub fn plan(&self) -> Result<Vec<RestoreJob>> {
        plan_restore(&self.ctx.config)
    }

    /// Run every restore job to a terminal state.
    pub async fn run(&self, jobs: Vec<RestoreJob>, shutdown: &CancellationToken) -> RunSummary {
        info!(
            jobs = jobs.len(),
            archive = jobs.first().map(|j| j.object_key.as_str()).unwrap_or_default(),
            "Starting restore run"
        );
        let ctx = self.ctx.clone();
        let tool = self.tool.clone();
        run_jobs(&self.ctx, "restore", jobs, shutdown, move |job, cancel| {
            restore_job(ctx.clone(), tool.clone(), job, cancel)
        })
        .await
    }
}

async fn restore_job(
    ctx: AppContext,
    tool: Arc<RemoteToolEngine>,
    job: Arc<RestoreJob>,
    cancel: CancellationToken,
) -> JobReport {
    let span = info_span!(
        "restore",
        job_id = %job.id,
        pod = %job.target.pod,
        container = %job.target.container
    );

    async move {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(archive = %job.object_key, dir = %job.extract_dir, "Restore started");

        let mut location = None;
        let channel = ctx.channel.as_ref();
        let steps = vec![
            Step::new("env_check", tool.ensure_installed(&job.target, &cancel)),
            Step::new(
                "fetch",
                tool.fetch(&job.target, &job.object_key, &job.remote_path, &cancel),
            ),
            Step::new("extract", async {
                extract(channel, &job, &cancel).await?;
                location = Some(job.extract_dir.clone());
                Ok::<_, TransferError>(())
            }),
            Step::new("load", load(&ctx, &job, &ctx.config.restore.load, &cancel)),
            Step::new("cleanup", cleanup(channel, &job)),
        ];
        let outcome = run_steps(&job.id, &ctx.progress, steps).await;

        let report = JobReport {
            job_id: job.id.clone(),
            target: job.target.clone(),
            archive_name: job.object_key.clone(),
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

async fn extract(
    channel: &dyn RemoteCommandChannel,
    job: &RestoreJob,
    cancel: &CancellationToken,
) -> Result<()> {
    let mkdir = RemoteCommand::make_dir(&job.extract_dir)?;
    cancellable(cancel, channel.run(&job.target, &mkdir)).await?;
    let untar = RemoteCommand::extract(&job.remote_path, &job.extract_dir)?;
    let output = cancellable(cancel, channel.run(&job.target, &untar)).await?;
    if !output.stderr.is_empty() {
        debug!(stderr = %output.stderr_lossy().trim(), "tar wrote to stderr");
    }
    Ok(())
}

/// Run the load command once per matching file, a few at a time.
///
/// The first failing load stops the rest.
async fn load(
    ctx: &AppContext,
    job: &RestoreJob,
    config: &LoadConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    if config.command.is_empty() {
        debug!("No load command configured");
        return Ok(());
    }
    let find = RemoteCommand::find_files(&job.extract_dir, &config.pattern)?;
    let listing = cancellable(cancel, ctx.channel.run(&job.target, &find)).await?;
    let files: Vec<String> = listing
        .stdout_lossy()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();
    if files.is_empty() {
        info!(pattern = %config.pattern, "Nothing to load");
        return Ok(());
    }

    let commands = files
        .iter()
        .map(|file| load_command(&config.command, file, &job.target.pod))
        .collect::<Result<Vec<_>>>()?;
    info!(files = commands.len(), concurrency = job.concurrency.get(), "Loading files");

    let channel = ctx.channel.clone();
    let target = job.target.clone();
    run_bounded(commands, job.concurrency, cancel, |index, command| {
        let channel = channel.clone();
        let target = target.clone();
        async move {
            channel.run(&target, &command).await?;
            debug!(unit = index, command = %command, "Loaded");
            Ok::<_, TransferError>(())
        }
    })
    .await?;
    Ok(())
}

/// Substitute `{file}` and `{pod}` into every argument of `template`.
fn load_command(template: &[String], file: &str, pod: &str) -> Result<RemoteCommand> {
    validate_remote_path(file)?;
    RemoteCommand::from_argv(
        template
            .iter()
            .map(|arg| arg.replace("{file}", file).replace("{pod}", pod)),
    )
}

async fn cleanup(channel: &dyn RemoteCommandChannel, job: &RestoreJob) -> Result<()> {
    if job.keep_remote {
        debug!(path = %job.remote_path, "Keeping downloaded archive");
        return Ok(());
    }
    let command = RemoteCommand::remove(&job.remote_path)?;
    channel.run(&job.target, &command).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.namespace = "iotdb".into();
        config.pods = vec!["datanode-0".into(), "datanode-1".into()];
        config.storage.bucket = "backups".into();
        config.restore.archive = Some("datanode-0_20240301123045.tar.gz".into());
        config
    }

    #[test]
    fn plans_one_restore_per_pod() {
        let jobs = plan_restore(&config()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].target.pod, "datanode-1");
        assert_eq!(jobs[0].remote_path, "/tmp/datanode-0_20240301123045.tar.gz");
        assert_eq!(jobs[0].extract_dir, "/tmp/podvault-restore");
        assert_ne!(jobs[0].id, jobs[1].id);
    }

    #[test]
    fn restore_without_archive_is_rejected() {
        let mut config = config();
        config.restore.archive = None;
        let err = plan_restore(&config).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        config.restore.archive = Some("../etc/passwd".into());
        assert!(plan_restore(&config).is_err());
    }

    #[test]
    fn load_argv_substitutes_file_and_pod() {
        let template = LoadConfig::default().command;
        let command = load_command(&template, "/restore/seq/1.tsfile", "datanode-0").unwrap();
        assert_eq!(
            command.argv(),
            [
                "/iotdb/sbin/start-cli.sh",
                "-h",
                "datanode-0",
                "-e",
                "load '/restore/seq/1.tsfile' verify=false",
            ]
        );
    }

    #[test]
    fn load_argv_rejects_option_like_files() {
        let template = LoadConfig::default().command;
        assert!(load_command(&template, "-rf", "datanode-0").is_err());
    }
}
