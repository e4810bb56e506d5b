//! Chunked download of a remote file over the exec channel.
//!
//! The file is split into fixed-size ranges; each range is fetched by a
//! byte-exact range read and streamed straight into its own offset of the
//! local file through an independent handle. Ranges are disjoint, so
//! workers never touch each other's bytes.

use std::io;
use std::num::{NonZeroU64, NonZeroUsize};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::inspector::remote_file_size;
use crate::core::models::{ByteRange, Target, partition};
use crate::core::pool::run_bounded;
use crate::core::progress::UnitProgress;
use crate::core::remote::{RemoteCommand, RemoteCommandChannel};
use crate::core::transfer_engine::{TransferPhase, TransferStatus};
use crate::error::{Result, TransferError};

/// Outcome of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub bytes: u64,
    pub chunks: usize,
}

pub struct ChunkedDownloader {
    channel: Arc<dyn RemoteCommandChannel>,
    chunk_size: NonZeroU64,
    concurrency: NonZeroUsize,
}

impl ChunkedDownloader {
    pub fn new(
        channel: Arc<dyn RemoteCommandChannel>,
        chunk_size: NonZeroU64,
        concurrency: NonZeroUsize,
    ) -> Self {
        Self {
            channel,
            chunk_size,
            concurrency,
        }
    }

    /// Fetch `remote_path` from `target` into `local_path`.
    ///
    /// On error the local file may be partially written; it is left in
    /// place for inspection and the call reports failure.
    pub async fn download(
        &self,
        target: &Target,
        remote_path: &str,
        local_path: &Path,
        progress: Option<mpsc::Sender<TransferStatus>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadSummary> {
        let started = Instant::now();
        let size = remote_file_size(self.channel.as_ref(), target, remote_path).await?;

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(local_path).await?;

        if size == 0 {
            info!(target = %target, remote_path, "Remote file is empty, created empty local file");
            return Ok(DownloadSummary { bytes: 0, chunks: 0 });
        }
        file.set_len(size).await?;

        let ranges = partition(size, self.chunk_size);
        let chunks = ranges.len();
        info!(
            target = %target,
            remote_path,
            local_path = %local_path.display(),
            size,
            chunks,
            chunk_size = self.chunk_size.get(),
            concurrency = self.concurrency.get(),
            "Starting chunked download"
        );

        let reporter = UnitProgress::new(progress, TransferPhase::Download, size, chunks);
        let written = run_bounded(ranges, self.concurrency, cancel, |index, range| {
            fetch_chunk(
                self.channel.clone(),
                target.clone(),
                remote_path.to_string(),
                local_path.to_path_buf(),
                index,
                range,
                reporter.clone(),
            )
        })
        .await?;

        let bytes: u64 = written.iter().sum();
        if bytes != size {
            return Err(TransferError::transfer(
                remote_path,
                format!("assembled {bytes} bytes, expected {size}"),
            ));
        }
        file.sync_all().await?;

        info!(
            target = %target,
            bytes,
            chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Chunked download complete"
        );
        Ok(DownloadSummary { bytes, chunks })
    }
}

async fn fetch_chunk(
    channel: Arc<dyn RemoteCommandChannel>,
    target: Target,
    remote_path: String,
    local_path: PathBuf,
    index: usize,
    range: ByteRange,
    reporter: UnitProgress,
) -> Result<u64> {
    let command = RemoteCommand::read_range(&remote_path, range)?;

    let mut file = OpenOptions::new().write(true).open(&local_path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut sink = RangeWriter::new(file, range.len());

    let streamed = channel
        .run_streaming(&target, &command, &mut sink)
        .await
        .map_err(|e| match e {
            TransferError::Io(io_err) => {
                TransferError::transfer(format!("chunk {index} {range}"), io_err)
            }
            other => other,
        })?;
    sink.flush().await?;

    if streamed != range.len() {
        return Err(TransferError::transfer(
            format!("chunk {index} {range}"),
            format!("short read: got {streamed} of {} bytes", range.len()),
        ));
    }

    debug!(chunk = index, range_start = range.start, bytes = streamed, "Chunk written");
    reporter.unit_done(streamed).await;
    Ok(streamed)
}

/// Writer that refuses to go past the end of its range.
struct RangeWriter<W> {
    inner: W,
    remaining: u64,
}

impl<W> RangeWriter<W> {
    fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RangeWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "remote sent more bytes than the requested range",
            )));
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..max]) {
            Poll::Ready(Ok(n)) => {
                this.remaining -= n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
