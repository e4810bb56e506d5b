use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use podvault::adapters::{MemoryStore, SimulatedChannel};
use podvault::core::Target;
use podvault::core::uploader::{MultipartUploader, RemoteFileSource, upload_file};
use tokio_util::sync::CancellationToken;

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

fn uploader(store: &MemoryStore, part: u64, concurrency: usize) -> MultipartUploader {
    MultipartUploader::new(
        Arc::new(store.clone()),
        NonZeroU64::new(part).unwrap(),
        NonZeroUsize::new(concurrency).unwrap(),
    )
}

fn local_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 253) as u8).collect()
}

#[tokio::test]
async fn part_numbers_follow_range_order_not_completion_order() {
    let store = MemoryStore::new();
    // Later parts finish first.
    for part in 1..=6u32 {
        store.delay_part(part, Duration::from_millis(u64::from(7 - part) * 15));
    }

    let dir = tempfile::tempdir().unwrap();
    let data = content(6 * 100 - 40);
    let path = local_file(&dir, "a.tar.gz", &data);

    let summary = upload_file(
        &uploader(&store, 100, 6),
        &path,
        "a.tar.gz",
        WEEK,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.parts, 6);
    let mut log = store.part_log();
    assert_ne!(log, vec![1, 2, 3, 4, 5, 6], "delays had no effect");
    log.sort_unstable();
    assert_eq!(log, vec![1, 2, 3, 4, 5, 6]);

    let object = store.object("a.tar.gz").unwrap();
    assert_eq!(object.bytes, data);
    assert!(object.expires_at.is_some());
    assert_eq!(store.completed(), 1);
    assert_eq!(store.aborted(), 0);
}

#[tokio::test]
async fn failing_part_aborts_once_and_never_completes() {
    let store = MemoryStore::new();
    store.fail_part(3);

    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "a.tar.gz", &content(8 * 100));

    let err = upload_file(
        &uploader(&store, 100, 2),
        &path,
        "a.tar.gz",
        WEEK,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "transfer");
    assert!(err.to_string().contains("part 3"));
    assert_eq!(store.initiated(), 1);
    assert_eq!(store.aborted(), 1);
    assert_eq!(store.completed(), 0);
    assert_eq!(store.open_sessions(), 0);
    assert!(store.object("a.tar.gz").is_none());
}

#[tokio::test]
async fn failed_abort_still_returns_part_error() {
    let store = MemoryStore::new();
    store.fail_part(1);
    store.fail_abort();

    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "a.tar.gz", &content(50));

    let err = upload_file(
        &uploader(&store, 100, 1),
        &path,
        "a.tar.gz",
        WEEK,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "transfer");
    assert_eq!(store.aborted(), 1);
    assert_eq!(store.completed(), 0);
}

#[tokio::test]
async fn failed_complete_aborts_the_session() {
    let store = MemoryStore::new();
    store.fail_complete();

    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "a.tar.gz", &content(3 * 100));

    let err = upload_file(
        &uploader(&store, 100, 2),
        &path,
        "a.tar.gz",
        WEEK,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "storage_protocol");
    assert!(err.to_string().contains("complete"));
    assert_eq!(store.part_log().len(), 3);
    assert_eq!(store.aborted(), 1);
    assert_eq!(store.completed(), 0);
    assert_eq!(store.open_sessions(), 0);
    assert!(store.object("a.tar.gz").is_none());
}

#[tokio::test]
async fn failed_initiate_uploads_nothing() {
    let store = MemoryStore::new();
    store.fail_initiate();

    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "a.tar.gz", &content(3 * 100));

    let err = upload_file(
        &uploader(&store, 100, 2),
        &path,
        "a.tar.gz",
        WEEK,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "storage_protocol");
    assert!(store.part_log().is_empty());
    assert_eq!(store.initiated(), 0);
    // No session exists, so there is nothing to abort.
    assert_eq!(store.aborted(), 0);
    assert_eq!(store.completed(), 0);
}

#[tokio::test]
async fn empty_file_uploads_as_one_empty_part() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "empty.tar.gz", b"");

    let summary = upload_file(
        &uploader(&store, 100, 3),
        &path,
        "empty.tar.gz",
        WEEK,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.parts, 1);
    assert_eq!(summary.bytes, 0);
    assert_eq!(store.part_log(), vec![1]);
    assert_eq!(store.object("empty.tar.gz").unwrap().bytes, Vec::<u8>::new());
    assert_eq!(store.completed(), 1);
}

#[tokio::test]
async fn concurrency_bound_holds_for_parts() {
    let store = MemoryStore::new();
    for part in 1..=12u32 {
        store.delay_part(part, Duration::from_millis(10));
    }
    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "a.tar.gz", &content(1200));

    upload_file(
        &uploader(&store, 100, 3),
        &path,
        "a.tar.gz",
        WEEK,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(store.max_in_flight() <= 3, "saw {}", store.max_in_flight());
}

#[tokio::test]
async fn cancellation_aborts_session() {
    let store = MemoryStore::new();
    for part in 1..=10u32 {
        store.delay_part(part, Duration::from_millis(50));
    }
    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "a.tar.gz", &content(1000));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(70)).await;
        trigger.cancel();
    });

    let err = upload_file(&uploader(&store, 100, 2), &path, "a.tar.gz", WEEK, None, &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(store.aborted(), 1);
    assert_eq!(store.completed(), 0);
}

#[tokio::test]
async fn parts_can_stream_from_the_container() {
    let target = Target::new("iotdb", "datanode-0", "iotdb-datanode");
    let channel = SimulatedChannel::new();
    let data = content(530);
    channel.put_file(&target, "/tmp/a.tar.gz", data.clone());

    let store = MemoryStore::new();
    let source = Arc::new(RemoteFileSource::new(
        Arc::new(channel.clone()),
        target,
        "/tmp/a.tar.gz",
    ));
    let summary = uploader(&store, 100, 3)
        .upload(source, "a.tar.gz", WEEK, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.parts, 6);
    assert_eq!(channel.calls_to("dd"), 6);
    assert_eq!(store.object("a.tar.gz").unwrap().bytes, data);
}
