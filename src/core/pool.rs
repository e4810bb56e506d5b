//! Bounded worker pool for chunk and part transfers, and restore loads.
//!
//! At most `concurrency` units run at once (semaphore permits are taken
//! before a unit is spawned). The first failing unit cancels the pool's
//! token: nothing new is scheduled and in-flight units are dropped at
//! their next await point, which kills any child process they own.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TransferError};

/// Run `worker` over every item with bounded concurrency.
///
/// Results come back in item order regardless of completion order.
/// Cancelling `parent` stops the pool with [`TransferError::Cancelled`];
/// a failing unit stops it with that unit's error.
pub async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    concurrency: NonZeroUsize,
    parent: &CancellationToken,
    worker: F,
) -> Result<Vec<T>>
where
    F: Fn(usize, I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let cancel = parent.child_token();
    let semaphore = Arc::new(Semaphore::new(concurrency.get()));
    let mut tasks: JoinSet<(usize, Result<T>)> = JoinSet::new();
    let mut outcome = Outcome::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        while let Some(joined) = tasks.try_join_next() {
            outcome.record(joined, &cancel);
        }
        if cancel.is_cancelled() {
            break;
        }

        let token = cancel.clone();
        let unit = worker(index, item);
        tasks.spawn(async move {
            let _permit = permit;
            tokio::select! {
                biased;
                _ = token.cancelled() => (index, Err(TransferError::Cancelled)),
                result = unit => {
                    if result.is_err() {
                        token.cancel();
                    }
                    (index, result)
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        outcome.record(joined, &cancel);
    }

    outcome.finish(parent)
}

struct Outcome<T> {
    done: Vec<(usize, T)>,
    first_error: Option<TransferError>,
}

impl<T> Outcome<T> {
    fn with_capacity(n: usize) -> Self {
        Self {
            done: Vec::with_capacity(n),
            first_error: None,
        }
    }

    fn record(
        &mut self,
        joined: std::result::Result<(usize, Result<T>), JoinError>,
        cancel: &CancellationToken,
    ) {
        let err = match joined {
            Ok((index, Ok(value))) => {
                self.done.push((index, value));
                return;
            }
            Ok((_, Err(e))) if e.is_cancelled() => return,
            Ok((index, Err(e))) => {
                debug!(unit = index, error = %e, "Unit failed, cancelling siblings");
                e
            }
            Err(join_err) => TransferError::transfer("worker", join_err),
        };
        cancel.cancel();
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    fn finish(mut self, parent: &CancellationToken) -> Result<Vec<T>> {
        if let Some(err) = self.first_error {
            return Err(err);
        }
        if parent.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.done.sort_unstable_by_key(|(index, _)| *index);
        Ok(self.done.into_iter().map(|(_, value)| value).collect())
    }
}
