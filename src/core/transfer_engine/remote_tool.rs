use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use crate::config::{RemoteToolConfig, StorageConfig};
use crate::core::inspector::remote_file_size;
use crate::core::models::Target;
use crate::core::remote::{RemoteCommand, RemoteCommandChannel, validate_remote_path};
use crate::core::storage::ObjectStore;
use crate::core::transfer_engine::{
    TransferEngine, TransferFuture, TransferPhase, TransferRequest, TransferResult,
    TransferStatus, report_failure,
};
use crate::error::{Result, TransferError};

/// Hand the upload to a utility running inside the container.
///
/// The utility is installed on first use when it is missing. Progress is
/// only known at the start and end, since the utility reports nothing back.
pub struct RemoteToolEngine {
    channel: Arc<dyn RemoteCommandChannel>,
    store: Arc<dyn ObjectStore>,
    tool: RemoteToolConfig,
    storage: StorageConfig,
}

impl RemoteToolEngine {
    pub fn new(
        channel: Arc<dyn RemoteCommandChannel>,
        store: Arc<dyn ObjectStore>,
        tool: RemoteToolConfig,
        storage: StorageConfig,
    ) -> Self {
        Self {
            channel,
            store,
            tool,
            storage,
        }
    }

    /// Install the utility in `target` unless it is already there.
    pub async fn ensure_installed(&self, target: &Target, cancel: &CancellationToken) -> Result<()> {
        ensure_tool(self.channel.as_ref(), target, &self.tool, cancel).await
    }

    /// Copy object `key` from the bucket to `remote_path` inside `target`.
    pub async fn fetch(
        &self,
        target: &Target,
        key: &str,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let command = fetch_command(&self.tool, &self.storage, key, remote_path)?;
        info!(command = %command, "Downloading into the container");
        run_cancellable(self.channel.as_ref(), target, &command, cancel).await
    }
}

impl TransferEngine for RemoteToolEngine {
    fn name(&self) -> &'static str {
        "remote-tool"
    }

    fn transfer(&self, req: &TransferRequest, tx: mpsc::Sender<TransferStatus>) -> TransferFuture {
        let job = req.job.clone();
        let cancel = req.cancel.clone();
        let channel = self.channel.clone();
        let store = self.store.clone();
        let tool = self.tool.clone();
        let storage = self.storage.clone();

        let span = info_span!("remote_tool_transfer", remote_path = %job.remote_path, key = %job.object_key);

        Box::pin(
            async move {
                let _ = tx.send(TransferStatus::Ready).await;
                let start_time = Instant::now();

                if !job.upload {
                    return report_failure(
                        &tx,
                        TransferError::InvalidArgument(
                            "remote-tool transfer needs uploads enabled".to_string(),
                        ),
                    )
                    .await;
                }

                let expires_at = Utc::now()
                    + chrono::Duration::from_std(job.expiry).unwrap_or(chrono::Duration::zero());
                let copy = match copy_command(&tool, &storage, &job.remote_path, &job.object_key, expires_at) {
                    Ok(command) => command,
                    Err(e) => return report_failure(&tx, e).await,
                };

                if let Err(e) = ensure_tool(channel.as_ref(), &job.target, &tool, &cancel).await {
                    return report_failure(&tx, e).await;
                }

                let size = match remote_file_size(channel.as_ref(), &job.target, &job.remote_path).await {
                    Ok(size) => size,
                    Err(e) => return report_failure(&tx, e).await,
                };
                let _ = tx
                    .send(TransferStatus::InProgress {
                        phase: TransferPhase::RemoteUpload,
                        total_bytes: size,
                        bytes_done: 0,
                        units_done: 0,
                        units_total: 1,
                        percentage: 0,
                    })
                    .await;

                info!(bytes = size, command = %copy, "Uploading from inside the container");
                if let Err(e) = run_cancellable(channel.as_ref(), &job.target, &copy, &cancel).await {
                    return report_failure(&tx, e).await;
                }

                let _ = tx
                    .send(TransferStatus::InProgress {
                        phase: TransferPhase::RemoteUpload,
                        total_bytes: size,
                        bytes_done: size,
                        units_done: 1,
                        units_total: 1,
                        percentage: 100,
                    })
                    .await;
                let _ = tx.send(TransferStatus::Complete).await;
                Ok(TransferResult {
                    total_bytes: size,
                    duration: start_time.elapsed(),
                    location: store.object_url(&job.object_key),
                })
            }
            .instrument(span),
        )
    }
}

/// Install the utility unless it is already executable.
async fn ensure_tool(
    channel: &dyn RemoteCommandChannel,
    target: &Target,
    tool: &RemoteToolConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let installed = RemoteCommand::new("test").args(["-x", tool.binary.as_str()]);
    match channel.run(target, &installed).await {
        Ok(_) => {
            debug!(binary = %tool.binary, "Upload utility present");
            return Ok(());
        }
        Err(TransferError::Command { .. }) => {}
        Err(e) => return Err(e),
    }

    info!(binary = %tool.binary, url = %tool.install_url, "Installing upload utility");
    let download = RemoteCommand::new("curl").args([
        "-fsSL",
        "-o",
        tool.binary.as_str(),
        tool.install_url.as_str(),
    ]);
    run_cancellable(channel, target, &download, cancel).await?;
    let chmod = RemoteCommand::new("chmod").args(["755", tool.binary.as_str()]);
    channel.run(target, &chmod).await?;
    Ok(())
}

async fn run_cancellable(
    channel: &dyn RemoteCommandChannel,
    target: &Target,
    command: &RemoteCommand,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        res = channel.run(target, command) => res.map(|_| ()),
    }
}

/// `<tool> cp SRC oss://BUCKET/KEY -e ENDPOINT -i AK -k SK -f --meta Expires:DATE`
fn copy_command(
    tool: &RemoteToolConfig,
    storage: &StorageConfig,
    remote_path: &str,
    key: &str,
    expires_at: DateTime<Utc>,
) -> Result<RemoteCommand> {
    let upload = tool_copy(tool, storage, remote_path, &object_uri(storage, key))?;
    Ok(upload
        .arg("--meta")
        .arg(format!("Expires:{}", http_date(expires_at))))
}

/// `<tool> cp oss://BUCKET/KEY DEST -e ENDPOINT -i AK -k SK -f`
fn fetch_command(
    tool: &RemoteToolConfig,
    storage: &StorageConfig,
    key: &str,
    remote_path: &str,
) -> Result<RemoteCommand> {
    tool_copy(tool, storage, &object_uri(storage, key), remote_path)
}

fn object_uri(storage: &StorageConfig, key: &str) -> String {
    format!("oss://{}/{}", storage.bucket, key)
}

fn tool_copy(
    tool: &RemoteToolConfig,
    storage: &StorageConfig,
    source: &str,
    destination: &str,
) -> Result<RemoteCommand> {
    validate_remote_path(&tool.binary)?;
    validate_remote_path(source)?;
    validate_remote_path(destination)?;
    let endpoint = storage.endpoint.as_deref().ok_or_else(|| {
        TransferError::InvalidArgument("remote-tool transfer needs storage.endpoint".to_string())
    })?;
    let (Some(access_key), Some(secret_key)) =
        (&storage.access_key_id, &storage.secret_access_key)
    else {
        return Err(TransferError::InvalidArgument(
            "remote-tool transfer needs storage credentials".to_string(),
        ));
    };

    Ok(RemoteCommand::new(tool.binary.as_str())
        .args(["cp", source, destination, "-e", endpoint, "-i"])
        .secret_arg(access_key.as_str())
        .arg("-k")
        .secret_arg(secret_key.as_str())
        .arg("-f"))
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
