use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{Instrument, info, info_span, warn};

use crate::core::downloader::ChunkedDownloader;
use crate::core::remote::RemoteCommandChannel;
use crate::core::storage::ObjectStore;
use crate::core::transfer_engine::{
    TransferEngine, TransferFuture, TransferPhase, TransferRequest, TransferResult,
    TransferStatus, report_failure,
};
use crate::core::uploader::{MultipartUploader, upload_file};
use crate::core::verifier::verify_download;

/// Pull the archive to local disk in chunks, then push it to the bucket.
///
/// The local copy is removed after a successful upload unless the job
/// keeps it. When the job does not upload, the local copy is the result.
pub struct RelayEngine {
    channel: Arc<dyn RemoteCommandChannel>,
    store: Arc<dyn ObjectStore>,
}

impl RelayEngine {
    pub fn new(channel: Arc<dyn RemoteCommandChannel>, store: Arc<dyn ObjectStore>) -> Self {
        Self { channel, store }
    }
}

impl TransferEngine for RelayEngine {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn transfer(&self, req: &TransferRequest, tx: mpsc::Sender<TransferStatus>) -> TransferFuture {
        let job = req.job.clone();
        let cancel = req.cancel.clone();
        let channel = self.channel.clone();
        let store = self.store.clone();

        let span = info_span!(
            "relay_transfer",
            remote_path = %job.remote_path,
            local_path = %job.local_path.display()
        );

        Box::pin(
            async move {
                let _ = tx.send(TransferStatus::Ready).await;
                let start_time = Instant::now();

                let downloader =
                    ChunkedDownloader::new(channel.clone(), job.chunk_size, job.concurrency);
                let downloaded = match downloader
                    .download(
                        &job.target,
                        &job.remote_path,
                        &job.local_path,
                        Some(tx.clone()),
                        &cancel,
                    )
                    .await
                {
                    Ok(summary) => summary,
                    Err(e) => return report_failure(&tx, e).await,
                };

                if job.verify {
                    let _ = tx
                        .send(TransferStatus::InProgress {
                            phase: TransferPhase::Verify,
                            total_bytes: downloaded.bytes,
                            bytes_done: 0,
                            units_done: 0,
                            units_total: 1,
                            percentage: 0,
                        })
                        .await;
                    if let Err(e) = verify_download(
                        channel.as_ref(),
                        &job.target,
                        &job.remote_path,
                        &job.local_path,
                    )
                    .await
                    {
                        return report_failure(&tx, e).await;
                    }
                }

                if !job.upload {
                    info!(bytes = downloaded.bytes, "Upload disabled, keeping local copy");
                    let _ = tx.send(TransferStatus::Complete).await;
                    return Ok(TransferResult {
                        total_bytes: downloaded.bytes,
                        duration: start_time.elapsed(),
                        location: job.local_path.display().to_string(),
                    });
                }

                let uploader = MultipartUploader::new(store.clone(), job.part_size, job.concurrency);
                let uploaded = match upload_file(
                    &uploader,
                    &job.local_path,
                    &job.object_key,
                    job.expiry,
                    Some(tx.clone()),
                    &cancel,
                )
                .await
                {
                    Ok(summary) => summary,
                    Err(e) => return report_failure(&tx, e).await,
                };

                if !job.keep_local {
                    if let Err(e) = tokio::fs::remove_file(&job.local_path).await {
                        warn!(error = %e, "Failed to remove local staging copy");
                    }
                }

                let _ = tx.send(TransferStatus::Complete).await;
                Ok(TransferResult {
                    total_bytes: uploaded.bytes,
                    duration: start_time.elapsed(),
                    location: store.object_url(&job.object_key),
                })
            }
            .instrument(span),
        )
    }
}
