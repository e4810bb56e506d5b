//! In-memory object store with protocol bookkeeping and fault injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::core::storage::{CompletedPart, ObjectStore, PartReader, UploadOptions};
use crate::error::{Result, TransferError};

/// A finished object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
}

struct Session {
    key: String,
    expires_at: Option<DateTime<Utc>>,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    sessions: HashMap<String, Session>,
    objects: HashMap<String, StoredObject>,
    failing_parts: HashSet<u32>,
    part_delays: HashMap<u32, Duration>,
    fail_initiate: bool,
    fail_complete: bool,
    fail_abort: bool,
    /// Part numbers in the order uploads finished.
    part_log: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    initiated: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    aborted: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    url_base: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url_base(mut self, base: impl Into<String>) -> Self {
        self.url_base = Some(base.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_part(&self, part_number: u32) {
        self.state().failing_parts.insert(part_number);
    }

    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state().part_delays.insert(part_number, delay);
    }

    pub fn fail_initiate(&self) {
        self.state().fail_initiate = true;
    }

    pub fn fail_complete(&self) {
        self.state().fail_complete = true;
    }

    pub fn fail_abort(&self) {
        self.state().fail_abort = true;
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state().objects.get(key).cloned()
    }

    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn part_log(&self) -> Vec<u32> {
        self.state().part_log.clone()
    }

    pub fn initiated(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn store_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        mut body: PartReader,
        length: u64,
    ) -> Result<CompletedPart> {
        let (delay, fail) = {
            let state = self.state();
            (
                state.part_delays.get(&part_number).copied(),
                state.failing_parts.contains(&part_number),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(TransferError::transfer(
                format!("part {part_number}"),
                "injected failure",
            ));
        }

        let mut bytes = Vec::with_capacity(length as usize);
        body.read_to_end(&mut bytes).await?;
        if bytes.len() as u64 != length {
            return Err(TransferError::transfer(
                format!("part {part_number}"),
                format!("body had {} bytes, expected {length}", bytes.len()),
            ));
        }

        let etag = hex::encode(Sha256::digest(&bytes));
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(upload_id)
            .filter(|s| s.key == key)
            .ok_or_else(|| TransferError::storage("upload_part", "no such upload"))?;
        session.parts.insert(part_number, (etag.clone(), bytes));
        state.part_log.push(part_number);
        Ok(CompletedPart { part_number, etag })
    }
}

/// Decrements the in-flight count even when the upload is dropped mid-way.
struct Leave<'a>(&'a AtomicUsize);

impl Drop for Leave<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn initiate_multipart_upload(&self, key: &str, options: &UploadOptions) -> Result<String> {
        let mut state = self.state();
        if state.fail_initiate {
            return Err(TransferError::storage("initiate", "injected failure"));
        }
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.sessions.insert(
            upload_id.clone(),
            Session {
                key: key.to_string(),
                expires_at: options.expires_at,
                parts: BTreeMap::new(),
            },
        );
        self.initiated.fetch_add(1, Ordering::SeqCst);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: PartReader,
        length: u64,
    ) -> Result<CompletedPart> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _leave = Leave(&self.in_flight);
        self.store_part(key, upload_id, part_number, body, length).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut state = self.state();
        if state.fail_complete {
            return Err(TransferError::storage("complete", "injected failure"));
        }
        let Some(session) = state.sessions.remove(upload_id) else {
            return Err(TransferError::storage("complete", "no such upload"));
        };
        if session.key != key {
            return Err(TransferError::storage("complete", "key mismatch"));
        }

        let mut bytes = Vec::new();
        for part in parts {
            match session.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => bytes.extend_from_slice(data),
                _ => {
                    return Err(TransferError::storage(
                        "complete",
                        format!("invalid part {}", part.part_number),
                    ));
                }
            }
        }
        state.objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                expires_at: session.expires_at,
            },
        );
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.fail_abort {
            return Err(TransferError::storage("abort", "injected failure"));
        }
        state.sessions.remove(upload_id);
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        match &self.url_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("memory://{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(bytes: &'static [u8]) -> PartReader {
        Box::new(bytes)
    }

    #[tokio::test]
    async fn assembles_parts_by_number() {
        let store = MemoryStore::new();
        let id = store
            .initiate_multipart_upload("k", &UploadOptions::default())
            .await
            .unwrap();
        let p2 = store.upload_part("k", &id, 2, body(b"world"), 5).await.unwrap();
        let p1 = store.upload_part("k", &id, 1, body(b"hello "), 6).await.unwrap();
        store
            .complete_multipart_upload("k", &id, &[p1, p2])
            .await
            .unwrap();

        assert_eq!(store.object("k").unwrap().bytes, b"hello world");
        assert_eq!(store.part_log(), vec![2, 1]);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn abort_drops_session() {
        let store = MemoryStore::new();
        let id = store
            .initiate_multipart_upload("k", &UploadOptions::default())
            .await
            .unwrap();
        store.abort_multipart_upload("k", &id).await.unwrap();
        assert_eq!(store.aborted(), 1);
        assert_eq!(store.open_sessions(), 0);
        assert!(store.object("k").is_none());
    }

    #[tokio::test]
    async fn short_body_is_rejected() {
        let store = MemoryStore::new();
        let id = store
            .initiate_multipart_upload("k", &UploadOptions::default())
            .await
            .unwrap();
        let err = store
            .upload_part("k", &id, 1, body(b"abc"), 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transfer");
    }
}
