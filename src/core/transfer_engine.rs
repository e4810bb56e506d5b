pub mod direct;
pub mod relay;
pub mod remote_tool;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::core::models::Job;
use crate::error::{Result, TransferError};

pub use direct::DirectEngine;
pub use relay::RelayEngine;
pub use remote_tool::RemoteToolEngine;

/// Which way the archive travels from the container to the bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TransferEngineType {
    /// Chunked download to local disk, then multipart upload from there.
    #[default]
    Relay,
    /// Multipart upload with parts read straight from the container.
    Direct,
    /// Upload utility executed inside the container.
    RemoteTool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Download,
    Verify,
    Upload,
    RemoteUpload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TransferStatus {
    Ready,
    InProgress {
        phase: TransferPhase,
        total_bytes: u64,
        bytes_done: u64,
        units_done: usize,
        units_total: usize,
        percentage: u8,
    },
    Complete,
    Failed(String),
}

#[derive(Clone)]
pub struct TransferRequest {
    pub job: Arc<Job>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub total_bytes: u64,
    pub duration: Duration,
    /// Object URL, or the local path when nothing was uploaded.
    pub location: String,
}

pub type TransferFuture = Pin<Box<dyn Future<Output = Result<TransferResult>> + Send>>;

/// Moves a job's archive from its container to its destination.
pub trait TransferEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn transfer(&self, req: &TransferRequest, tx: mpsc::Sender<TransferStatus>) -> TransferFuture;
}

pub fn create_engine(engine_type: TransferEngineType, ctx: &AppContext) -> Arc<dyn TransferEngine> {
    match engine_type {
        TransferEngineType::Relay => Arc::new(RelayEngine::new(ctx.channel.clone(), ctx.store.clone())),
        TransferEngineType::Direct => {
            Arc::new(DirectEngine::new(ctx.channel.clone(), ctx.store.clone()))
        }
        TransferEngineType::RemoteTool => Arc::new(RemoteToolEngine::new(
            ctx.channel.clone(),
            ctx.store.clone(),
            ctx.config.remote_tool.clone(),
            ctx.config.storage.clone(),
        )),
    }
}

/// Report a failure on the status channel and hand the error back.
pub(crate) async fn report_failure<T>(
    tx: &mpsc::Sender<TransferStatus>,
    err: TransferError,
) -> Result<T> {
    let _ = tx.send(TransferStatus::Failed(err.to_string())).await;
    Err(err)
}
