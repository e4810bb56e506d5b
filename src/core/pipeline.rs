//! Sequential step runner for one job.
//!
//! The runner owns the job's state transitions after planning: it publishes
//! `Running { step }` as each step starts and the terminal state at the end.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use chrono::Utc;
use tracing::{Instrument, error, info, info_span};

use crate::core::models::{JobState, StepError, StepRecord};
use crate::core::progress::ProgressTracker;
use crate::error::Result;

pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A named operation. Nothing runs until the pipeline reaches it.
pub struct Step<'a> {
    name: &'static str,
    op: StepFuture<'a>,
}

impl<'a> Step<'a> {
    pub fn new(name: &'static str, op: impl Future<Output = Result<()>> + Send + 'a) -> Self {
        Self {
            name,
            op: Box::pin(op),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub state: JobState,
    /// One record per step that ran, in order.
    pub steps: Vec<StepRecord>,
}

/// Run `steps` in order, stopping at the first failure.
///
/// Steps after a failure are never polled and leave no record.
pub async fn run_steps(
    job_id: &str,
    progress: &ProgressTracker,
    steps: Vec<Step<'_>>,
) -> PipelineOutcome {
    let outcome = run_in_order(job_id, progress, steps).await;
    progress.set_state(job_id, outcome.state.clone()).await;
    outcome
}

async fn run_in_order(
    job_id: &str,
    progress: &ProgressTracker,
    steps: Vec<Step<'_>>,
) -> PipelineOutcome {
    let mut records = Vec::with_capacity(steps.len());

    for step in steps {
        progress
            .set_state(
                job_id,
                JobState::Running {
                    step: step.name.to_string(),
                },
            )
            .await;
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = step
            .op
            .instrument(info_span!("step", name = step.name))
            .await;
        let duration = clock.elapsed();

        match result {
            Ok(()) => {
                info!(step = step.name, duration_ms = duration.as_millis() as u64, "Step finished");
                records.push(StepRecord {
                    name: step.name.to_string(),
                    started_at,
                    duration,
                    error: None,
                });
            }
            Err(e) => {
                error!(
                    step = step.name,
                    kind = e.kind(),
                    error = %e,
                    duration_ms = duration.as_millis() as u64,
                    "Step failed"
                );
                let step_error = StepError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                };
                records.push(StepRecord {
                    name: step.name.to_string(),
                    started_at,
                    duration,
                    error: Some(step_error.clone()),
                });
                return PipelineOutcome {
                    state: JobState::Failed {
                        step: step.name.to_string(),
                        error: step_error,
                    },
                    steps: records,
                };
            }
        }
    }

    PipelineOutcome {
        state: JobState::Succeeded,
        steps: records,
    }
}
