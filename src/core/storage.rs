//! Object-store side of the multipart protocol.
//!
//! [`ObjectStore`] is the seam between the uploader and a concrete backend
//! (S3-compatible service, in-memory fake). The uploader owns the session
//! lifecycle; a store only executes the four protocol calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use crate::error::Result;

/// Bounded reader over exactly one part's bytes.
pub type PartReader = Box<dyn AsyncRead + Send + Unpin>;

/// Options attached to a new multipart session.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// When the store may reclaim the object.
    pub expires_at: Option<DateTime<Utc>>,
    /// Desired number of parallel part uploads.
    pub workers: usize,
}

/// A part the store accepted, as it must be listed on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// Store-assigned identifier (ETag for S3).
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a session and return its upload id.
    async fn initiate_multipart_upload(&self, key: &str, options: &UploadOptions)
    -> Result<String>;

    /// Upload `length` bytes from `body` as part `part_number` (1-based).
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: PartReader,
        length: u64,
    ) -> Result<CompletedPart>;

    /// Commit the session. `parts` is sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Where a finished object can be found, for reports.
    fn object_url(&self, key: &str) -> String;
}
