use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use podvault::adapters::{MemoryStore, Response, SimulatedChannel};
use podvault::config::AppConfig;
use podvault::context::AppContext;
use podvault::core::notifications::{JobEvent, NotificationChannel};
use podvault::core::transfer_engine::{
    TransferEngine, TransferEngineType, TransferFuture, TransferRequest, TransferResult,
    TransferStatus,
};
use podvault::core::{JobReport, JobState, Orchestrator, ProgressTracker, Target};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FLUSH: &str = "/iotdb/sbin/start-cli.sh";

struct Cluster {
    channel: SimulatedChannel,
    store: MemoryStore,
    dir: tempfile::TempDir,
}

impl Cluster {
    fn new(pods: &[&str]) -> Self {
        let channel = SimulatedChannel::new();
        for pod in pods {
            let target = target(pod);
            channel.put_file(&target, "/iotdb/data/sequence/1.tsfile", vec![7u8; 1500]);
            channel.put_file(&target, "/iotdb/data/sequence/2.tsfile", vec![9u8; 321]);
        }
        channel.script(FLUSH, [Response::ok()]);
        Self {
            channel,
            store: MemoryStore::new(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self, pods: &[&str]) -> AppConfig {
        let mut config = AppConfig::default();
        config.namespace = "iotdb".into();
        config.pods = pods.iter().map(|p| p.to_string()).collect();
        config.local_dir = self.dir.path().to_path_buf();
        config.chunk_size = 256;
        config.concurrency = 2;
        config.flush.settle_secs = 0;
        config.storage.bucket = "backups".into();
        config
    }

    fn context(&self, config: AppConfig) -> AppContext {
        AppContext::new(
            config,
            Arc::new(self.channel.clone()),
            Arc::new(self.store.clone()),
        )
    }
}

fn target(pod: &str) -> Target {
    Target::new("iotdb", pod, "iotdb-datanode")
}

fn step_names(report: &JobReport) -> Vec<&str> {
    report.steps.iter().map(|s| s.name.as_str()).collect()
}

async fn run(ctx: AppContext) -> Vec<JobReport> {
    let orchestrator = Orchestrator::new(ctx);
    let jobs = orchestrator.plan().unwrap();
    orchestrator
        .run(jobs, &CancellationToken::new())
        .await
        .reports
}

#[tokio::test]
async fn relay_backup_runs_every_step() {
    let cluster = Cluster::new(&["datanode-0"]);
    let ctx = cluster.context(cluster.config(&["datanode-0"]));
    let progress = ctx.progress.clone();

    let reports = run(ctx).await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];

    assert_eq!(report.state, JobState::Succeeded);
    assert_eq!(step_names(report), ["flush", "compress", "transfer", "cleanup"]);
    assert!(report.steps.iter().all(|s| s.succeeded()));

    let key = &report.archive_name;
    assert_eq!(report.location.as_deref(), Some(format!("memory://{key}").as_str()));
    let object = cluster.store.object(key).unwrap();
    assert!(object.bytes.len() > 1821);

    // Remote archive and local staging copy are both gone.
    assert!(cluster.channel.file(&target("datanode-0"), &format!("/tmp/{key}")).is_none());
    assert!(!cluster.dir.path().join(key).exists());
    assert_eq!(cluster.channel.calls_to(FLUSH), 1);
    assert_eq!(cluster.channel.calls_to("sha256sum"), 1);

    assert_eq!(report.last_transfer, Some(TransferStatus::Complete));
    assert_eq!(progress.unfinished().await, 0);
    let tracked = progress.get(&report.job_id).await.unwrap();
    assert_eq!(tracked.state, JobState::Succeeded);
    assert_eq!(tracked.transfer, Some(TransferStatus::Complete));
}

#[tokio::test]
async fn failing_job_does_not_disturb_its_sibling() {
    let cluster = Cluster::new(&["datanode-0", "datanode-1"]);
    cluster.channel.fail_program(
        &target("datanode-1"),
        "tar",
        Response::fail(2, "tar: /iotdb/data/: file changed as we read it"),
    );

    let reports = run(cluster.context(cluster.config(&["datanode-0", "datanode-1"]))).await;
    assert_eq!(reports.len(), 2);

    let ok = &reports[0];
    assert_eq!(ok.target.pod, "datanode-0");
    assert_eq!(ok.state, JobState::Succeeded);
    assert_eq!(ok.steps.len(), 4);
    assert!(cluster.store.object(&ok.archive_name).is_some());

    let failed = &reports[1];
    assert_eq!(failed.target.pod, "datanode-1");
    match &failed.state {
        JobState::Failed { step, error } => {
            assert_eq!(step, "compress");
            assert_eq!(error.kind, "command");
            assert!(error.message.contains("file changed"));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(step_names(failed), ["flush", "compress"]);
    assert!(failed.location.is_none());
    assert!(cluster.store.object(&failed.archive_name).is_none());
}

#[tokio::test]
async fn healthy_sibling_is_not_slowed_by_a_failing_job() {
    let latency = Duration::from_millis(10);

    let solo = Cluster::new(&["datanode-0"]);
    solo.channel.set_latency(latency);
    let baseline = run(solo.context(solo.config(&["datanode-0"]))).await[0].duration;

    let pair = Cluster::new(&["datanode-0", "datanode-1"]);
    pair.channel.set_latency(latency);
    pair.channel
        .fail_program(&target("datanode-1"), "tar", Response::fail(2, "tar: write error"));
    let reports = run(pair.context(pair.config(&["datanode-0", "datanode-1"]))).await;

    let (ok, failed) = (&reports[0], &reports[1]);
    assert_eq!(ok.state, JobState::Succeeded);
    assert!(!failed.succeeded());
    assert!(
        ok.duration < baseline * 2 + Duration::from_millis(250),
        "sibling took {:?}, alone {baseline:?}",
        ok.duration
    );
    assert!(failed.duration < ok.duration);
}

#[tokio::test]
async fn unreachable_pod_fails_at_flush() {
    let cluster = Cluster::new(&["datanode-0"]);
    cluster.channel.set_unreachable(&target("datanode-0"));

    let reports = run(cluster.context(cluster.config(&["datanode-0"]))).await;
    match &reports[0].state {
        JobState::Failed { step, error } => {
            assert_eq!(step, "flush");
            assert_eq!(error.kind, "connection");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(reports[0].steps.len(), 1);
}

#[tokio::test]
async fn flush_check_is_polled_until_it_passes() {
    let cluster = Cluster::new(&["datanode-0"]);
    cluster.channel.script(
        "flush-done",
        [Response::fail(1, "pending"), Response::fail(1, "pending"), Response::ok()],
    );
    let mut config = cluster.config(&["datanode-0"]);
    config.flush.check = Some(vec!["flush-done".into()]);
    config.flush.check_interval_secs = 0;

    let reports = run(cluster.context(config)).await;
    assert_eq!(reports[0].state, JobState::Succeeded);
    assert_eq!(cluster.channel.calls_to("flush-done"), 3);
}

#[tokio::test]
async fn exhausted_flush_check_times_out() {
    let cluster = Cluster::new(&["datanode-0"]);
    cluster.channel.script("flush-done", [Response::fail(1, "pending")]);
    let mut config = cluster.config(&["datanode-0"]);
    config.flush.check = Some(vec!["flush-done".into()]);
    config.flush.check_interval_secs = 0;
    config.flush.check_attempts = 4;

    let reports = run(cluster.context(config)).await;
    match &reports[0].state {
        JobState::Failed { step, error } => {
            assert_eq!(step, "flush");
            assert_eq!(error.kind, "timeout");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(cluster.channel.calls_to("flush-done"), 4);
}

#[tokio::test]
async fn direct_strategy_skips_local_staging() {
    let cluster = Cluster::new(&["datanode-0"]);
    let mut config = cluster.config(&["datanode-0"]);
    config.strategy = TransferEngineType::Direct;
    config.keep_remote = true;

    let reports = run(cluster.context(config)).await;
    let report = &reports[0];
    assert_eq!(report.state, JobState::Succeeded);

    let remote = cluster
        .channel
        .file(&target("datanode-0"), &format!("/tmp/{}", report.archive_name))
        .expect("remote archive kept");
    assert_eq!(cluster.store.object(&report.archive_name).unwrap().bytes, remote);
    assert_eq!(std::fs::read_dir(cluster.dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn remote_tool_installs_utility_once_per_container() {
    let cluster = Cluster::new(&["datanode-0"]);
    let mut config = cluster.config(&["datanode-0"]);
    config.strategy = TransferEngineType::RemoteTool;
    config.storage.endpoint = Some("oss-cn-hangzhou.aliyuncs.com".into());
    config.storage.access_key_id = Some("AKID".into());
    config.storage.secret_access_key = Some("SECRET".into());

    let reports = run(cluster.context(config.clone())).await;
    assert_eq!(reports[0].state, JobState::Succeeded, "{:?}", reports[0].state);
    assert_eq!(cluster.channel.calls_to("curl"), 1);

    let uploads = cluster.channel.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(
        uploads[0].destination,
        format!("oss://backups/{}", reports[0].archive_name)
    );

    // Second run finds the utility already installed.
    run(cluster.context(config)).await;
    assert_eq!(cluster.channel.calls_to("curl"), 1);
    assert_eq!(cluster.channel.uploads().len(), 2);
}

#[tokio::test]
async fn local_only_run_keeps_the_download() {
    let cluster = Cluster::new(&["datanode-0"]);
    let mut config = cluster.config(&["datanode-0"]);
    config.upload = false;

    let reports = run(cluster.context(config)).await;
    let report = &reports[0];
    assert_eq!(report.state, JobState::Succeeded);

    let local = cluster.dir.path().join(&report.archive_name);
    assert!(local.exists());
    assert_eq!(report.location.as_deref(), Some(local.display().to_string().as_str()));
    assert_eq!(cluster.store.initiated(), 0);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<JobEvent>>,
}

#[async_trait]
impl NotificationChannel for Recorder {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn every_terminal_job_is_notified() {
    let cluster = Cluster::new(&["datanode-0", "datanode-1"]);
    cluster.channel.set_unreachable(&target("datanode-1"));
    let recorder = Arc::new(Recorder::default());
    let notifier: Arc<dyn NotificationChannel> = recorder.clone();
    let ctx = cluster
        .context(cluster.config(&["datanode-0", "datanode-1"]))
        .with_notifier(Some(notifier));

    let reports = run(ctx).await;
    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|e| matches!(e, JobEvent::Completed { .. })
        && e.job_id() == reports[0].job_id));
    assert!(events.iter().any(|e| matches!(e, JobEvent::Failed { step, .. } if step == "flush")
        && e.job_id() == reports[1].job_id));
}

/// Engine that reads the tracker mid-transfer and reports instantly.
struct Observing {
    progress: ProgressTracker,
    seen: Arc<Mutex<Vec<Option<JobState>>>>,
}

impl TransferEngine for Observing {
    fn name(&self) -> &'static str {
        "observing"
    }

    fn transfer(&self, req: &TransferRequest, tx: mpsc::Sender<TransferStatus>) -> TransferFuture {
        let progress = self.progress.clone();
        let seen = self.seen.clone();
        let job = req.job.clone();
        Box::pin(async move {
            let _ = tx.send(TransferStatus::Ready).await;
            let state = progress.get(&job.id).await.map(|p| p.state);
            seen.lock().unwrap().push(state);
            let _ = tx.send(TransferStatus::Complete).await;
            Ok(TransferResult {
                total_bytes: 0,
                duration: Duration::ZERO,
                location: format!("test://{}", job.object_key),
            })
        })
    }
}

#[tokio::test]
async fn tracker_shows_the_running_step() {
    let cluster = Cluster::new(&["datanode-0"]);
    let ctx = cluster.context(cluster.config(&["datanode-0"]));
    let progress = ctx.progress.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = Arc::new(Observing {
        progress: progress.clone(),
        seen: seen.clone(),
    });

    let orchestrator = Orchestrator::with_engine(ctx, engine);
    let jobs = orchestrator.plan().unwrap();
    let job_id = jobs[0].id.clone();
    let summary = orchestrator.run(jobs, &CancellationToken::new()).await;

    assert_eq!(
        *seen.lock().unwrap(),
        [Some(JobState::Running { step: "transfer".into() })]
    );
    let report = &summary.reports[0];
    assert_eq!(report.location.as_deref(), Some(format!("test://{}", report.archive_name).as_str()));
    assert_eq!(progress.get(&job_id).await.unwrap().state, JobState::Succeeded);
}

struct Panicking;

async fn engine_bug() -> podvault::error::Result<TransferResult> {
    panic!("engine bug")
}

impl TransferEngine for Panicking {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn transfer(&self, _req: &TransferRequest, _tx: mpsc::Sender<TransferStatus>) -> TransferFuture {
        Box::pin(engine_bug())
    }
}

#[tokio::test]
async fn panicking_job_is_reported_and_tracked_as_failed() {
    let cluster = Cluster::new(&["datanode-0"]);
    let ctx = cluster.context(cluster.config(&["datanode-0"]));
    let progress = ctx.progress.clone();

    let orchestrator = Orchestrator::with_engine(ctx, Arc::new(Panicking));
    let jobs = orchestrator.plan().unwrap();
    let summary = orchestrator.run(jobs, &CancellationToken::new()).await;

    let report = &summary.reports[0];
    match &report.state {
        JobState::Failed { step, error } => {
            assert_eq!(step, "job");
            assert_eq!(error.kind, "panic");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(progress.get(&report.job_id).await.unwrap().state, report.state);
    assert_eq!(progress.unfinished().await, 0);
}
