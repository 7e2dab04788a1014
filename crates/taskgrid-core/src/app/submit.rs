//! SubmitService - タスクの登録と配送
//!
//! # 手順
//! 1. サイズ検査（上限超過は `PayloadTooLarge`、何も書かない）
//! 2. inline 閾値を超える payload は Blob storage へ
//! 3. PENDING レコードを `put_if_absent`
//! 4. 優先度シャードへ `{task_id, task_priority}` を送信
//!
//! タスク表への書き込みが必ず先。送信がリトライ上限まで失敗した場合は
//! PENDING→FAILED へ条件付きで巻き戻し、キューに載らない PENDING を残さない。

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::app::config::PayloadPolicy;
use crate::app::retry::RetryPolicy;
use crate::domain::{
    GridError, NewTask, PayloadRef, Result, SessionId, TaskId, TaskRecord, TaskStatus, TaskUpdate,
};
use crate::metrics::GridMetrics;
use crate::observability::task_span;
use crate::ports::artifact_store::payload_key;
use crate::ports::{BlobStore, Clock, IdGenerator, QueueRouter, TaskMessage, TaskStore};

/// One task to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub task: NewTask,
    pub payload: Vec<u8>,
}

/// What the caller gets back after a successful submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    pub task_priority: u32,
    pub payload_external: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub session_id: SessionId,
    pub tasks: Vec<SubmitReceipt>,
}

pub struct SubmitService {
    store: Arc<dyn TaskStore>,
    router: Arc<dyn QueueRouter>,
    blobs: Arc<dyn BlobStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    policy: PayloadPolicy,
    retry: RetryPolicy,
    metrics: GridMetrics,
}

impl SubmitService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        router: Arc<dyn QueueRouter>,
        blobs: Arc<dyn BlobStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        policy: PayloadPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            router,
            blobs,
            ids,
            clock,
            policy,
            retry,
            metrics: GridMetrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: GridMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let started = Instant::now();
        let result = self.submit_one(request).await;
        self.metrics.record_request("submit", &result, started.elapsed());
        result
    }

    async fn submit_one(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        validate(&request)?;
        let offload = self.policy.should_offload(request.payload.len())?;
        let task_id = self.ids.generate_task_id();
        self.submit_with_id(task_id, request, offload)
            .instrument(task_span("submit", task_id))
            .await
    }

    /// Submit several tasks under one session.
    ///
    /// Every request is validated before anything is written. Tasks are then
    /// submitted in order; the first failure stops the batch and is returned,
    /// tasks submitted before it stay live.
    pub async fn submit_batch(
        &self,
        session_id: SessionId,
        requests: Vec<SubmitRequest>,
    ) -> Result<BatchReceipt> {
        let started = Instant::now();
        let result = self.submit_all(session_id, requests).await;
        self.metrics.record_request("submit_batch", &result, started.elapsed());
        result
    }

    async fn submit_all(
        &self,
        session_id: SessionId,
        requests: Vec<SubmitRequest>,
    ) -> Result<BatchReceipt> {
        if requests.is_empty() {
            return Err(GridError::InvalidRequest("batch is empty".to_string()));
        }
        let mut planned = Vec::with_capacity(requests.len());
        for mut request in requests {
            validate(&request)?;
            let offload = self.policy.should_offload(request.payload.len())?;
            request.task.session_id = Some(session_id.clone());
            planned.push((request, offload));
        }

        let mut tasks = Vec::with_capacity(planned.len());
        for (request, offload) in planned {
            let task_id = self.ids.generate_task_id();
            let receipt = self
                .submit_with_id(task_id, request, offload)
                .instrument(task_span("submit", task_id))
                .await
                .inspect_err(|e| {
                    tracing::warn!(
                        session_id = %session_id,
                        submitted = tasks.len(),
                        error = %e,
                        "batch submit stopped"
                    );
                })?;
            tasks.push(receipt);
        }
        tracing::info!(session_id = %session_id, count = tasks.len(), "batch submitted");
        Ok(BatchReceipt { session_id, tasks })
    }

    /// Re-send the queue message of a PENDING task.
    ///
    /// Returns `false` without sending when the task is in any other state.
    /// Sending twice is harmless: the second claim loses the CAS.
    pub async fn redispatch(&self, task_id: TaskId) -> Result<bool> {
        let record = self
            .retry
            .call("store", "get", || self.store.get(task_id))
            .await?
            .ok_or(GridError::NotFound(task_id))?;
        if record.task_status != TaskStatus::Pending {
            tracing::debug!(task_id = %task_id, status = %record.task_status, "redispatch skipped");
            return Ok(false);
        }
        self.enqueue(&record).await?;
        tracing::info!(task_id = %task_id, "task redispatched");
        Ok(true)
    }

    async fn submit_with_id(
        &self,
        task_id: TaskId,
        request: SubmitRequest,
        offload: bool,
    ) -> Result<SubmitReceipt> {
        let SubmitRequest { task, payload } = request;
        let payload = if offload {
            let key = payload_key(task_id);
            let blob = self
                .retry
                .call("blob", "put", || self.blobs.put(&key, payload.clone()))
                .await?;
            PayloadRef::External(blob)
        } else {
            PayloadRef::Inline(payload)
        };

        let record = TaskRecord::new_pending(task, payload, task_id, self.clock.now());
        if let Err(err) = self.insert(&record).await {
            self.discard_payload(&record.payload).await;
            return Err(err);
        }

        if let Err(err) = self.enqueue(&record).await {
            self.roll_back(task_id, &err).await;
            return Err(err);
        }

        tracing::info!(
            priority = record.task_priority,
            external = record.payload.is_external(),
            "task submitted"
        );
        self.metrics.record_submitted(record.task_priority, record.payload.is_external());
        Ok(SubmitReceipt {
            task_id,
            task_status: record.task_status,
            task_priority: record.task_priority,
            payload_external: record.payload.is_external(),
        })
    }

    /// `put_if_absent` under retry. A retried insert that finds its own
    /// earlier write (the first attempt timed out after landing) succeeds.
    async fn insert(&self, record: &TaskRecord) -> Result<()> {
        match self
            .retry
            .call("store", "put_if_absent", || {
                self.store.put_if_absent(record.clone())
            })
            .await
        {
            Err(GridError::AlreadyExists(task_id)) => {
                let stored = self
                    .retry
                    .call("store", "get", || self.store.get(task_id))
                    .await?;
                if stored.as_ref() == Some(record) {
                    Ok(())
                } else {
                    Err(GridError::AlreadyExists(task_id))
                }
            }
            other => other,
        }
    }

    async fn enqueue(&self, record: &TaskRecord) -> Result<()> {
        let shard = self.router.shard_for(record.task_priority);
        let message = TaskMessage {
            task_id: record.task_id,
            task_priority: record.task_priority,
        };
        self.retry
            .call("queue", "send", || shard.send(message))
            .await
    }

    async fn roll_back(&self, task_id: TaskId, cause: &GridError) {
        let update = TaskUpdate::none().with_error(format!("enqueue failed: {cause}"));
        match self
            .retry
            .call("store", "compare_and_swap_status", || {
                self.store.compare_and_swap_status(
                    task_id,
                    TaskStatus::Pending,
                    TaskStatus::Failed,
                    update.clone(),
                )
            })
            .await
        {
            Ok(_) => {
                self.metrics.record_rollback("submit");
                tracing::warn!(error = %cause, "enqueue failed, task rolled back to FAILED")
            }
            // a worker or Cancel got there first; the task is not orphaned
            Err(e) if e.is_stale_state() => {
                tracing::info!(error = %cause, "enqueue failed but task already moved on")
            }
            Err(e) => tracing::error!(
                error = %cause,
                rollback_error = %e,
                "enqueue failed and rollback failed, task left PENDING until redispatched"
            ),
        }
    }

    async fn discard_payload(&self, payload: &PayloadRef) {
        if let PayloadRef::External(blob) = payload
            && let Err(e) = self
                .retry
                .call("blob", "delete", || self.blobs.delete(blob))
                .await
        {
            tracing::warn!(key = %blob.key, error = %e, "failed to delete orphaned payload");
        }
    }
}

fn validate(request: &SubmitRequest) -> Result<()> {
    if request.task.owner.trim().is_empty() {
        return Err(GridError::InvalidRequest("task_owner must not be empty".to_string()));
    }
    Ok(())
}
