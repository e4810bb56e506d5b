use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use podvault::adapters::SimulatedChannel;
use podvault::core::transfer_engine::{TransferPhase, TransferStatus};
use podvault::core::{ChunkedDownloader, Target, verify_download};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

fn target() -> Target {
    Target::new("iotdb", "datanode-0", "iotdb-datanode")
}

fn content(size: u64) -> Vec<u8> {
    (0..size).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

fn downloader(channel: &SimulatedChannel, chunk: u64, concurrency: usize) -> ChunkedDownloader {
    ChunkedDownloader::new(
        Arc::new(channel.clone()),
        NonZeroU64::new(chunk).unwrap(),
        NonZeroUsize::new(concurrency).unwrap(),
    )
}

#[tokio::test]
async fn reassembles_files_of_edge_sizes() {
    let chunk = 64;
    let dir = tempfile::tempdir().unwrap();

    for size in [0, 1, chunk - 1, chunk, chunk + 1, 5 * chunk + 137] {
        let channel = SimulatedChannel::new();
        let data = content(size);
        channel.put_file(&target(), "/tmp/archive.tar.gz", data.clone());

        let local = dir.path().join(format!("archive-{size}.tar.gz"));
        let summary = downloader(&channel, chunk, 3)
            .download(
                &target(),
                "/tmp/archive.tar.gz",
                &local,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.bytes, size, "size {size}");
        assert_eq!(summary.chunks as u64, size.div_ceil(chunk), "size {size}");
        assert_eq!(std::fs::read(&local).unwrap(), data, "size {size}");
        assert_eq!(channel.calls_to("dd") as u64, size.div_ceil(chunk), "size {size}");
    }
}

#[tokio::test]
async fn twenty_five_mib_in_three_range_reads() {
    let channel = SimulatedChannel::new();
    let data = content(25 * MIB);
    let expected = hex::encode(Sha256::digest(&data));
    channel.put_file(&target(), "/tmp/big.tar.gz", data);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("big.tar.gz");
    let (tx, mut rx) = mpsc::channel(16);
    let summary = downloader(&channel, 10 * MIB, 3)
        .download(
            &target(),
            "/tmp/big.tar.gz",
            &local,
            Some(tx),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.chunks, 3);
    assert_eq!(channel.calls_to("dd"), 3);
    assert_eq!(std::fs::metadata(&local).unwrap().len(), 25 * MIB);

    let verified = verify_download(&channel, &target(), "/tmp/big.tar.gz", &local)
        .await
        .unwrap();
    assert_eq!(verified.sha256, expected);

    let mut chunk_bytes = Vec::new();
    while let Ok(status) = rx.try_recv() {
        if let TransferStatus::InProgress {
            phase: TransferPhase::Download,
            bytes_done,
            ..
        } = status
        {
            chunk_bytes.push(bytes_done);
        }
    }
    assert_eq!(chunk_bytes.len(), 3);
    assert_eq!(chunk_bytes.last(), Some(&(25 * MIB)));
}

#[tokio::test]
async fn never_exceeds_concurrency() {
    let channel = SimulatedChannel::new();
    channel.put_file(&target(), "/tmp/a.tar.gz", content(40 * 100));
    channel.set_latency(Duration::from_millis(15));

    let dir = tempfile::tempdir().unwrap();
    downloader(&channel, 100, 4)
        .download(
            &target(),
            "/tmp/a.tar.gz",
            &dir.path().join("a.tar.gz"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(channel.max_in_flight() <= 4, "saw {}", channel.max_in_flight());
    assert!(channel.max_in_flight() >= 2);
}

#[tokio::test]
async fn failed_chunk_fails_download_and_stops_the_rest() {
    let channel = SimulatedChannel::new();
    channel.put_file(&target(), "/tmp/a.tar.gz", content(50 * 100));
    channel.set_latency(Duration::from_millis(10));
    channel.fail_read_at(200);

    let dir = tempfile::tempdir().unwrap();
    let err = downloader(&channel, 100, 2)
        .download(
            &target(),
            "/tmp/a.tar.gz",
            &dir.path().join("a.tar.gz"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "command");
    assert!(err.to_string().contains("Input/output error"));
    assert!(channel.calls_to("dd") < 50, "scheduling did not stop");
    assert_eq!(channel.in_flight(), 0);
}

#[tokio::test]
async fn missing_remote_file_is_not_found() {
    let channel = SimulatedChannel::new();
    let dir = tempfile::tempdir().unwrap();
    let err = downloader(&channel, 100, 2)
        .download(
            &target(),
            "/tmp/missing.tar.gz",
            &dir.path().join("missing.tar.gz"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn cancellation_stops_download() {
    let channel = SimulatedChannel::new();
    channel.put_file(&target(), "/tmp/a.tar.gz", content(20 * 100));
    channel.set_latency(Duration::from_millis(50));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        trigger.cancel();
    });

    let dir = tempfile::tempdir().unwrap();
    let err = downloader(&channel, 100, 2)
        .download(
            &target(),
            "/tmp/a.tar.gz",
            &dir.path().join("a.tar.gz"),
            None,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(channel.calls_to("dd") < 20);
}
