use std::fmt;
use std::num::{NonZeroU64, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::core::transfer_engine::TransferStatus;

/// A container inside a pod, addressed through the exec channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl Target {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod, self.container)
    }
}

/// Immutable description of one backup transfer.
///
/// Built once per `(pod, container)` when a run starts and shared by
/// reference for the rest of the job. Sizes and the concurrency cap are
/// non-zero by construction.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub target: Target,
    /// Directory inside the container that gets archived.
    pub data_dir: String,
    /// Archive file name, also used as the object key.
    pub archive_name: String,
    /// Absolute or cwd-relative archive path inside the container.
    pub remote_path: String,
    /// Where the relay strategy stages the archive locally.
    pub local_path: PathBuf,
    pub object_key: String,
    pub chunk_size: NonZeroU64,
    pub part_size: NonZeroU64,
    pub concurrency: NonZeroUsize,
    #[serde(serialize_with = "serialize_secs")]
    pub expiry: Duration,
    pub upload: bool,
    pub keep_local: bool,
    pub keep_remote: bool,
    pub verify: bool,
}

/// Immutable description of one restore: fetch an archive from the bucket
/// into a container, unpack it and load what it contains.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreJob {
    pub id: String,
    pub target: Target,
    /// Object key of the archive, also its file name inside the container.
    pub object_key: String,
    /// Where the archive is downloaded inside the container.
    pub remote_path: String,
    /// Directory the archive is unpacked into.
    pub extract_dir: String,
    /// Load commands running at once.
    pub concurrency: NonZeroUsize,
    pub keep_remote: bool,
}

/// What every kind of job exposes to the run loop.
pub trait JobIdentity: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn target(&self) -> &Target;
    /// Archive the job produces or consumes.
    fn archive_name(&self) -> &str;
}

impl JobIdentity for Job {
    fn id(&self) -> &str {
        &self.id
    }

    fn target(&self) -> &Target {
        &self.target
    }

    fn archive_name(&self) -> &str {
        &self.archive_name
    }
}

impl JobIdentity for RestoreJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn target(&self) -> &Target {
        &self.target
    }

    fn archive_name(&self) -> &str {
        &self.object_key
    }
}

/// Half-open byte interval `[start, end)` over a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "range start {start} past end {end}");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Split `[0, size)` into contiguous ranges of `unit` bytes.
///
/// Returns `ceil(size / unit)` ranges in offset order; the last one may be
/// short. A zero-size file yields no ranges.
pub fn partition(size: u64, unit: NonZeroU64) -> Vec<ByteRange> {
    let unit = unit.get();
    let count = size.div_ceil(unit);
    (0..count)
        .map(|i| {
            let start = i * unit;
            ByteRange::new(start, (start + unit).min(size))
        })
        .collect()
}

/// Outcome of one named pipeline step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub error: Option<StepError>,
}

impl StepRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running { step: String },
    Succeeded,
    Failed { step: String, error: StepError },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Everything a job produced, handed to notification collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub target: Target,
    pub archive_name: String,
    pub state: JobState,
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Object URL or local path of the finished archive, or the directory
    /// a restore unpacked into.
    pub location: Option<String>,
    /// Last engine status seen before the job ended.
    pub last_transfer: Option<TransferStatus>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}
