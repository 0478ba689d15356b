//! Bounded fan-out for batches of independent operations.
//!
//! Every batch-apply path (workspace mutations, git polling) goes through
//! [`run_bounded`] so a large batch never has more than `limit` workers in
//! flight. Completion order is unspecified and one failing item never stops
//! the rest of the batch.

use std::{fmt::Display, future::Future, sync::Arc};

use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinSet};

/// Outcome counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.completed + self.failed
    }
}

/// Run `worker` over every `Some` item with at most `limit` in flight.
///
/// `None` entries are skipped without invoking the worker. A `limit` of zero
/// behaves as one. Errors and panics are counted per item and logged.
pub async fn run_bounded<T, F, Fut, E>(items: Vec<Option<T>>, limit: usize, worker: F) -> BatchReport
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut report = BatchReport::default();
    if items.is_empty() {
        return report;
    }

    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();

    for item in items {
        let Some(item) = item else {
            report.skipped += 1;
            continue;
        };
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            report.skipped += 1;
            continue;
        };
        let fut = worker(item);
        tasks.spawn(async move {
            let result = fut.await;
            drop(permit);
            result
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => report.completed += 1,
            Ok(Err(error)) => {
                report.failed += 1;
                tracing::warn!(target = "agent_mux::limiter", error = %error, "batch item failed");
            }
            Err(join_error) => {
                report.failed += 1;
                tracing::warn!(
                    target = "agent_mux::limiter",
                    panicked = join_error.is_panic(),
                    error = %join_error,
                    "batch item aborted"
                );
            }
        }
    }

    report
}
