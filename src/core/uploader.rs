//! Multipart upload driver.
//!
//! Runs the three-phase protocol (initiate, upload parts, complete) against
//! an [`ObjectStore`]. Part numbers are assigned from range position
//! (1-based) before any work starts, so completion order never affects
//! assembly. Any part failure or caller cancellation aborts the session.

use std::num::{NonZeroU64, NonZeroUsize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::inspector::remote_file_size;
use crate::core::models::{ByteRange, Target, partition};
use crate::core::pool::run_bounded;
use crate::core::progress::UnitProgress;
use crate::core::remote::{RemoteCommand, RemoteCommandChannel};
use crate::core::storage::{CompletedPart, ObjectStore, PartReader, UploadOptions};
use crate::core::transfer_engine::{TransferPhase, TransferStatus};
use crate::error::{Result, TransferError};

/// Largest part count S3-compatible stores accept for one session.
pub const MAX_PARTS: usize = 10_000;

/// Where part bytes come from.
#[async_trait]
pub trait PartSource: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    async fn size(&self) -> Result<u64>;

    /// A reader yielding exactly `range.len()` bytes starting at `range.start`.
    async fn open_range(&self, range: ByteRange) -> Result<PartReader>;
}

/// Parts read from a local file.
pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PartSource for LocalFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn size(&self) -> Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }

    async fn open_range(&self, range: ByteRange) -> Result<PartReader> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;
        Ok(Box::new(file.take(range.len())))
    }
}

/// Parts read straight out of a remote file with range reads.
pub struct RemoteFileSource {
    channel: Arc<dyn RemoteCommandChannel>,
    target: Target,
    path: String,
}

impl RemoteFileSource {
    pub fn new(channel: Arc<dyn RemoteCommandChannel>, target: Target, path: impl Into<String>) -> Self {
        Self {
            channel,
            target,
            path: path.into(),
        }
    }
}

#[async_trait]
impl PartSource for RemoteFileSource {
    fn describe(&self) -> String {
        format!("{}:{}", self.target, self.path)
    }

    async fn size(&self) -> Result<u64> {
        remote_file_size(self.channel.as_ref(), &self.target, &self.path).await
    }

    async fn open_range(&self, range: ByteRange) -> Result<PartReader> {
        if range.is_empty() {
            return Ok(Box::new(tokio::io::empty()));
        }
        let command = RemoteCommand::read_range(&self.path, range)?;
        let output = self.channel.run(&self.target, &command).await?;
        if output.stdout.len() as u64 != range.len() {
            return Err(TransferError::transfer(
                format!("{} {range}", self.describe()),
                format!(
                    "short read: got {} of {} bytes",
                    output.stdout.len(),
                    range.len()
                ),
            ));
        }
        Ok(Box::new(std::io::Cursor::new(output.stdout)))
    }
}

/// State of one multipart session, owned by a single upload.
///
/// `complete` and `abort` both consume the session, so a session can end
/// only one way.
#[derive(Debug)]
pub struct UploadSession {
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl UploadSession {
    async fn initiate(store: &dyn ObjectStore, key: &str, options: &UploadOptions) -> Result<Self> {
        let upload_id = store.initiate_multipart_upload(key, options).await?;
        info!(key, upload_id = %upload_id, "Multipart session initiated");
        Ok(Self {
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    fn record(&mut self, part: CompletedPart) {
        self.parts.push(part);
    }

    async fn complete(mut self, store: &dyn ObjectStore) -> Result<()> {
        self.parts.sort_unstable_by_key(|p| p.part_number);
        let contiguous = self
            .parts
            .iter()
            .enumerate()
            .all(|(i, p)| p.part_number as usize == i + 1);
        if !contiguous {
            let numbers: Vec<u32> = self.parts.iter().map(|p| p.part_number).collect();
            let err = TransferError::storage(
                "complete",
                format!("part numbers are not 1..={}: {numbers:?}", self.parts.len()),
            );
            self.abort(store).await;
            return Err(err);
        }

        if let Err(e) = store
            .complete_multipart_upload(&self.key, &self.upload_id, &self.parts)
            .await
        {
            // A failed commit leaves the session open on the store.
            self.abort(store).await;
            return Err(e);
        }
        info!(key = %self.key, upload_id = %self.upload_id, parts = self.parts.len(), "Multipart session completed");
        Ok(())
    }

    /// Abort the session. A failed abort is logged for manual cleanup; the
    /// caller already has the error that caused the abort.
    async fn abort(self, store: &dyn ObjectStore) {
        match store.abort_multipart_upload(&self.key, &self.upload_id).await {
            Ok(()) => warn!(key = %self.key, upload_id = %self.upload_id, "Multipart session aborted"),
            Err(e) => error!(
                key = %self.key,
                upload_id = %self.upload_id,
                error = %e,
                "Multipart abort failed, manual cleanup required"
            ),
        }
    }
}

/// Outcome of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub key: String,
    pub upload_id: String,
    pub parts: usize,
    pub bytes: u64,
}

pub struct MultipartUploader {
    store: Arc<dyn ObjectStore>,
    part_size: NonZeroU64,
    concurrency: NonZeroUsize,
}

impl MultipartUploader {
    pub fn new(store: Arc<dyn ObjectStore>, part_size: NonZeroU64, concurrency: NonZeroUsize) -> Self {
        Self {
            store,
            part_size,
            concurrency,
        }
    }

    /// Upload everything `source` yields to `key`.
    ///
    /// An empty source still goes through a full one-part session.
    pub async fn upload(
        &self,
        source: Arc<dyn PartSource>,
        key: &str,
        expiry: Duration,
        progress: Option<mpsc::Sender<TransferStatus>>,
        cancel: &CancellationToken,
    ) -> Result<UploadSummary> {
        let started = Instant::now();
        let size = source.size().await?;

        let mut ranges = partition(size, self.part_size);
        if ranges.is_empty() {
            ranges.push(ByteRange::new(0, 0));
        }
        let parts_total = ranges.len();
        if parts_total > MAX_PARTS {
            return Err(TransferError::InvalidArgument(format!(
                "{size} bytes in {}-byte parts needs {parts_total} parts, limit is {MAX_PARTS}",
                self.part_size
            )));
        }

        let options = UploadOptions {
            expires_at: chrono::Duration::from_std(expiry)
                .ok()
                .map(|ttl| Utc::now() + ttl),
            workers: self.concurrency.get(),
        };
        let mut session = UploadSession::initiate(self.store.as_ref(), key, &options).await?;
        info!(
            source = %source.describe(),
            key,
            size,
            parts = parts_total,
            part_size = self.part_size.get(),
            concurrency = self.concurrency.get(),
            "Starting multipart upload"
        );

        let reporter = UnitProgress::new(progress, TransferPhase::Upload, size, parts_total);
        let upload_id = session.upload_id().to_string();
        let uploaded = run_bounded(ranges, self.concurrency, cancel, |index, range| {
            upload_one(
                self.store.clone(),
                source.clone(),
                key.to_string(),
                upload_id.clone(),
                (index + 1) as u32,
                range,
                reporter.clone(),
            )
        })
        .await;

        match uploaded {
            Ok(parts) => {
                for part in parts {
                    session.record(part);
                }
                session.complete(self.store.as_ref()).await?;
            }
            Err(e) => {
                warn!(key, upload_id = %upload_id, error = %e, "Part upload failed, aborting session");
                session.abort(self.store.as_ref()).await;
                return Err(e);
            }
        }

        info!(
            key,
            bytes = size,
            parts = parts_total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Multipart upload complete"
        );
        Ok(UploadSummary {
            key: key.to_string(),
            upload_id,
            parts: parts_total,
            bytes: size,
        })
    }
}

async fn upload_one(
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn PartSource>,
    key: String,
    upload_id: String,
    part_number: u32,
    range: ByteRange,
    reporter: UnitProgress,
) -> Result<CompletedPart> {
    let body = source.open_range(range).await?;
    let part = store
        .upload_part(&key, &upload_id, part_number, body, range.len())
        .await?;
    if part.part_number != part_number {
        return Err(TransferError::storage(
            "upload_part",
            format!("store returned part {} for part {part_number}", part.part_number),
        ));
    }
    debug!(part_number, range_start = range.start, bytes = range.len(), "Part uploaded");
    reporter.unit_done(range.len()).await;
    Ok(part)
}

/// Convenience for the common local-file case.
pub async fn upload_file(
    uploader: &MultipartUploader,
    path: &Path,
    key: &str,
    expiry: Duration,
    progress: Option<mpsc::Sender<TransferStatus>>,
    cancel: &CancellationToken,
) -> Result<UploadSummary> {
    uploader
        .upload(Arc::new(LocalFileSource::new(path)), key, expiry, progress, cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn local_source_reads_exact_range() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789abcdef").unwrap();

        let source = LocalFileSource::new(tmp.path());
        assert_eq!(source.size().await.unwrap(), 16);

        let mut reader = source.open_range(ByteRange::new(4, 10)).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"456789");
    }

    #[tokio::test]
    async fn local_source_empty_range() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let source = LocalFileSource::new(tmp.path());

        let mut reader = source.open_range(ByteRange::new(0, 0)).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
