//! CancelService - 競合に強い取り消し
//!
//! {PENDING, RUNNING} → CANCELLED を条件付き遷移で行う。
//! 取り消し後のワーカーの終了書き込みは `StaleState` で弾かれる。

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::app::retry::RetryPolicy;
use crate::domain::{GridError, Result, TaskId, TaskStatus, TaskUpdate};
use crate::metrics::GridMetrics;
use crate::observability::task_span;
use crate::ports::{ResultCache, TaskStore};

/// Re-read / re-try limit when the status keeps changing underneath.
const MAX_CANCEL_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub task_id: TaskId,
    /// Status observed when the cancel was decided.
    pub previous_status: TaskStatus,
    pub task_status: TaskStatus,
    /// `false` when the task was already terminal (no-op).
    pub cancelled: bool,
}

pub struct CancelService {
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn ResultCache>,
    retry: RetryPolicy,
    cache_retry: RetryPolicy,
    metrics: GridMetrics,
}

impl CancelService {
    pub fn new(store: Arc<dyn TaskStore>, cache: Arc<dyn ResultCache>, retry: RetryPolicy) -> Self {
        let cache_retry = RetryPolicy::once(retry.timeout);
        Self {
            store,
            cache,
            retry,
            cache_retry,
            metrics: GridMetrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: GridMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Cancel `task_id`. When `owner` is given it must match the submitter.
    pub async fn cancel(&self, task_id: TaskId, owner: Option<&str>) -> Result<CancelOutcome> {
        let started = Instant::now();
        let outcome = self
            .cancel_inner(task_id, owner)
            .instrument(task_span("cancel", task_id))
            .await;
        self.metrics.record_request("cancel", &outcome, started.elapsed());
        if let Ok(outcome) = &outcome {
            self.metrics.record_cancel(outcome.cancelled);
        }
        outcome
    }

    async fn cancel_inner(&self, task_id: TaskId, owner: Option<&str>) -> Result<CancelOutcome> {
        let mut last_conflict = None;
        for attempt in 1..=MAX_CANCEL_ATTEMPTS {
            let record = self
                .retry
                .call("store", "get", || self.store.get(task_id))
                .await?
                .ok_or(GridError::NotFound(task_id))?;

            if let Some(owner) = owner
                && owner != record.task_owner
            {
                return Err(GridError::Forbidden {
                    task_id,
                    owner: owner.to_string(),
                });
            }

            if record.task_status.is_terminal() {
                tracing::debug!(
                    status = %record.task_status,
                    "already terminal, nothing to cancel"
                );
                return Ok(CancelOutcome {
                    task_id,
                    previous_status: record.task_status,
                    task_status: record.task_status,
                    cancelled: false,
                });
            }

            let expected = record.task_status;
            let reason = match owner {
                Some(owner) => format!("cancelled by {owner}"),
                None => "cancelled".to_string(),
            };
            let written = self
                .retry
                .call("store", "compare_and_swap_status", || {
                    self.store.compare_and_swap_status(
                        task_id,
                        expected,
                        TaskStatus::Cancelled,
                        TaskUpdate::none().with_error(reason.clone()),
                    )
                })
                .await;

            match written {
                Ok(record) => {
                    if let Err(e) = self
                        .cache_retry
                        .call("cache", "invalidate", || self.cache.invalidate(task_id))
                        .await
                    {
                        tracing::warn!(error = %e, "cache invalidation failed");
                    }
                    tracing::info!(previous = %expected, "task cancelled");
                    return Ok(CancelOutcome {
                        task_id,
                        previous_status: expected,
                        task_status: record.task_status,
                        cancelled: true,
                    });
                }
                Err(e) if e.is_stale_state() => {
                    tracing::debug!(attempt, error = %e, "cancel lost a race, re-reading");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or(GridError::NotFound(task_id)))
    }
}
