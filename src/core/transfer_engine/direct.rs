use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{Instrument, info_span};

use crate::core::remote::RemoteCommandChannel;
use crate::core::storage::ObjectStore;
use crate::core::transfer_engine::{
    TransferEngine, TransferFuture, TransferRequest, TransferResult, TransferStatus,
    report_failure,
};
use crate::core::uploader::{MultipartUploader, RemoteFileSource};
use crate::error::TransferError;

/// Multipart upload whose parts are range-read from the container, with
/// no local staging copy.
pub struct DirectEngine {
    channel: Arc<dyn RemoteCommandChannel>,
    store: Arc<dyn ObjectStore>,
}

impl DirectEngine {
    pub fn new(channel: Arc<dyn RemoteCommandChannel>, store: Arc<dyn ObjectStore>) -> Self {
        Self { channel, store }
    }
}

impl TransferEngine for DirectEngine {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn transfer(&self, req: &TransferRequest, tx: mpsc::Sender<TransferStatus>) -> TransferFuture {
        let job = req.job.clone();
        let cancel = req.cancel.clone();
        let channel = self.channel.clone();
        let store = self.store.clone();

        let span = info_span!("direct_transfer", remote_path = %job.remote_path, key = %job.object_key);

        Box::pin(
            async move {
                let _ = tx.send(TransferStatus::Ready).await;
                let start_time = Instant::now();

                if !job.upload {
                    return report_failure(
                        &tx,
                        TransferError::InvalidArgument(
                            "direct transfer needs uploads enabled".to_string(),
                        ),
                    )
                    .await;
                }

                let source = Arc::new(RemoteFileSource::new(
                    channel,
                    job.target.clone(),
                    job.remote_path.clone(),
                ));
                let uploader = MultipartUploader::new(store.clone(), job.part_size, job.concurrency);
                let uploaded = match uploader
                    .upload(source, &job.object_key, job.expiry, Some(tx.clone()), &cancel)
                    .await
                {
                    Ok(summary) => summary,
                    Err(e) => return report_failure(&tx, e).await,
                };

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
