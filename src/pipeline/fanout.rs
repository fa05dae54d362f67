//! Concurrent per-field execution with isolated failures.
//!
//! Each field becomes one future; up to `concurrency` of them are in flight
//! at once via `buffer_unordered`. Every future is wrapped so that it always
//! yields a result for its field, whatever happens: its own success or
//! failure, `Timeout` when the shared deadline fires first, or `Cancelled`
//! when the run (or, with `abort_on_first_failure`, a sibling) cancels it.
//! The output map therefore has exactly the input's keys.
//!
//! All futures are polled inside the caller's task, so dropping the
//! returned future drops every in-flight call with it.

use crate::error::StageFailure;
use crate::pipeline::run::RunBudget;
use crate::stage::{FieldMap, StageKind, StageResult};
use futures::stream::{self, StreamExt};
use std::future::Future;
use tokio::time::sleep_until;
use tracing::debug;

/// Runs one operation over every field of a [`FieldMap`].
#[derive(Debug, Clone, Copy)]
pub struct FanOutExecutor {
    concurrency: usize,
    abort_on_first_failure: bool,
}

impl FanOutExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            abort_on_first_failure: false,
        }
    }

    /// When set, the first failing field cancels all siblings still running;
    /// they are reported as `Cancelled`.
    pub fn abort_on_first_failure(mut self, abort: bool) -> Self {
        self.abort_on_first_failure = abort;
        self
    }

    /// Apply `op` to every item and collect one result per field name.
    ///
    /// `op` receives the field name, its input and the batch budget. The
    /// returned map carries no ordering guarantee beyond its key order.
    pub async fn run<I, O, F, Fut>(
        &self,
        stage: StageKind,
        items: FieldMap<I>,
        budget: &RunBudget,
        op: F,
    ) -> FieldMap<StageResult<O>>
    where
        F: Fn(String, I, RunBudget) -> Fut,
        Fut: Future<Output = StageResult<O>>,
    {
        let total = items.len();
        let batch = budget.child();
        let abort = self.abort_on_first_failure;
        debug!("{stage}: fanning out over {total} fields (concurrency {})", self.concurrency);

        let results: FieldMap<StageResult<O>> = stream::iter(items.into_iter().map(|(name, input)| {
            let item_budget = batch.clone();
            let call = op(name.clone(), input, item_budget.clone());
            let run_cancel = budget.cancel.clone();
            async move {
                let result = tokio::select! {
                    biased;
                    _ = sleep_until(item_budget.deadline) => Err(StageFailure::timeout(
                        stage,
                        "run deadline exceeded before the field completed",
                    )),
                    _ = item_budget.cancel.cancelled() => Err(if run_cancel.is_cancelled() {
                        StageFailure::cancelled(stage, "run cancelled")
                    } else {
                        StageFailure::cancelled(stage, "aborted after a sibling field failed")
                    }),
                    result = call => result,
                };
                if abort && result.is_err() {
                    item_budget.cancel.cancel();
                }
                (name, result)
            }
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        debug!(
            "{stage}: {}/{} fields succeeded",
            results.values().filter(|r| r.is_ok()).count(),
            total
        );
        results
    }
}
