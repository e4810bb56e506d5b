pub mod downloader;
pub mod inspector;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod remote;
pub mod restore;
pub mod storage;
pub mod transfer_engine;
pub mod uploader;
pub mod verifier;

pub use downloader::{ChunkedDownloader, DownloadSummary};
pub use models::{
    ByteRange, Job, JobReport, JobState, RestoreJob, StepError, StepRecord, Target, partition,
};
pub use orchestrator::{Orchestrator, RunSummary, plan_jobs};
pub use progress::ProgressTracker;
pub use remote::{CommandOutput, RemoteCommand, RemoteCommandChannel};
pub use restore::{Restorer, plan_restore};
pub use storage::{CompletedPart, ObjectStore, UploadOptions};
pub use uploader::{MultipartUploader, UploadSummary};
pub use verifier::{VerifyResult, verify_download};
