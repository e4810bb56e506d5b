//! Live state of every job in a run.
//!
//! Chunk and part workers report through [`UnitProgress`], which turns
//! per-unit completions into [`TransferStatus`] updates on an mpsc channel.
//! The orchestrator drains that channel into the shared [`ProgressTracker`].
//! The pipeline runner moves each job through `Pending`, `Running { step }`
//! and a terminal state in the same tracker. Entries stay after a job ends,
//! so the tracker doubles as the run's status board.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};

use super::models::JobState;
use super::transfer_engine::{TransferPhase, TransferStatus};

/// What is known about one job right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub state: JobState,
    /// Latest status from the transfer engine, if the job got that far.
    pub transfer: Option<TransferStatus>,
}

impl JobProgress {
    fn pending() -> Self {
        Self {
            state: JobState::Pending,
            transfer: None,
        }
    }
}

/// Shared, cloneable status board keyed by job id.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<BTreeMap<String, JobProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, job_id: &str, state: JobState) {
        let mut map = self.inner.write().await;
        map.entry(job_id.to_string())
            .or_insert_with(JobProgress::pending)
            .state = state;
    }

    /// Record the latest engine status for a job.
    pub async fn update(&self, job_id: &str, status: TransferStatus) {
        let mut map = self.inner.write().await;
        map.entry(job_id.to_string())
            .or_insert_with(JobProgress::pending)
            .transfer = Some(status);
    }

    pub async fn get(&self, job_id: &str) -> Option<JobProgress> {
        self.inner.read().await.get(job_id).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, JobProgress> {
        self.inner.read().await.clone()
    }

    /// Jobs not yet in a terminal state.
    pub async fn unfinished(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|p| !p.state.is_terminal())
            .count()
    }
}

/// Per-unit progress reporter shared by the workers of one pool.
///
/// Progress advances once per completed chunk or part, by that unit's
/// byte count. Without a sender it only counts.
#[derive(Clone)]
pub struct UnitProgress {
    inner: Arc<UnitProgressInner>,
}

struct UnitProgressInner {
    tx: Option<mpsc::Sender<TransferStatus>>,
    phase: TransferPhase,
    total_bytes: u64,
    units_total: usize,
    bytes_done: AtomicU64,
    units_done: AtomicUsize,
}

impl UnitProgress {
    pub fn new(
        tx: Option<mpsc::Sender<TransferStatus>>,
        phase: TransferPhase,
        total_bytes: u64,
        units_total: usize,
    ) -> Self {
        Self {
            inner: Arc::new(UnitProgressInner {
                tx,
                phase,
                total_bytes,
                units_total,
                bytes_done: AtomicU64::new(0),
                units_done: AtomicUsize::new(0),
            }),
        }
    }

    /// Record one finished unit of `bytes` and publish the new totals.
    pub async fn unit_done(&self, bytes: u64) {
        let inner = &self.inner;
        let bytes_done = inner.bytes_done.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let units_done = inner.units_done.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some(tx) = &inner.tx {
            let _ = tx
                .send(TransferStatus::InProgress {
                    phase: inner.phase,
                    total_bytes: inner.total_bytes,
                    bytes_done,
                    units_done,
                    units_total: inner.units_total,
                    percentage: percentage(bytes_done, inner.total_bytes),
                })
                .await;
        }
    }
}

fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0) as u8
}
