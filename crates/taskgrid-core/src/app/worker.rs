//! Worker - claim / heartbeat / 終了書き込みのプロトコルとワーカーグループ
//!
//! # フロー
//! 1. 優先度の高いシャードから順に receive
//! 2. claim: PENDING→RUNNING（claim_id, worker_id, receive_count, heartbeat = now + lease）
//! 3. 実行中は heartbeat 間隔ごとに renew（RUNNING→RUNNING + visibility 延長）
//! 4. complete / fail: claim_id 付きの条件付き書き込み
//! 5. メッセージを delete
//!
//! 取り消しや再キューで claim を失ったワーカーの書き込みは `StaleState` で弾かれ、
//! 結果は破棄される。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app::config::{GridConfig, HeartbeatSettings, PayloadPolicy};
use crate::app::retry::RetryPolicy;
use crate::domain::{
    ClaimId, GridError, PayloadRef, Result, SessionId, TaskId, TaskRecord, TaskStatus, TaskUpdate,
    WorkerId,
};
use crate::observability::task_span;
use crate::ports::artifact_store::result_key;
use crate::ports::{
    BlobStore, Clock, Delivery, DeliveryQueue, IdGenerator, QueueRouter, TaskStore, to_chrono,
};

/// What an executor sees of a claimed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_id: TaskId,
    pub task_priority: u32,
    pub task_owner: String,
    pub session_id: Option<SessionId>,
    pub payload: Vec<u8>,
    /// Delivery count of the message behind this claim.
    pub receive_count: u32,
    pub retry_count: u32,
}

/// Failure reported by an executor; stored as the task's error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The work itself. Returning `Ok` completes the task with that result.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, input: &TaskInput) -> std::result::Result<Vec<u8>, ExecutionError>;
}

/// One RUNNING episode held by this worker.
pub struct Claim {
    pub claim_id: ClaimId,
    pub record: TaskRecord,
    pub delivery: Delivery,
    queue: Arc<dyn DeliveryQueue>,
}

impl Claim {
    pub fn task_id(&self) -> TaskId {
        self.record.task_id
    }
}

/// Result of a terminal write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalWrite {
    Written(TaskStatus),
    /// The claim was lost (cancelled, requeued, expired); nothing was written.
    Superseded,
}

pub struct WorkerAgent {
    worker_id: WorkerId,
    store: Arc<dyn TaskStore>,
    router: Arc<dyn QueueRouter>,
    blobs: Arc<dyn BlobStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    heartbeat: HeartbeatSettings,
    visibility_timeout: Duration,
    policy: PayloadPolicy,
    retry: RetryPolicy,
    idle_wait: Duration,
}

impl WorkerAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: WorkerId,
        store: Arc<dyn TaskStore>,
        router: Arc<dyn QueueRouter>,
        blobs: Arc<dyn BlobStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: &GridConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            worker_id,
            store,
            router,
            blobs,
            ids,
            clock,
            heartbeat: config.heartbeat.clone(),
            visibility_timeout: config.queue.visibility_timeout,
            policy: config.payload.clone(),
            retry,
            idle_wait: Duration::from_millis(100),
        }
    }

    /// Sleep between empty polls.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Take one visible message, most urgent shard first.
    pub async fn poll(&self) -> Result<Option<(Arc<dyn DeliveryQueue>, Delivery)>> {
        for shard in self.router.shards_by_urgency() {
            let received = self
                .retry
                .call("queue", "receive", || shard.receive(Duration::ZERO))
                .await?;
            if let Some(delivery) = received {
                return Ok(Some((shard, delivery)));
            }
        }
        Ok(None)
    }

    /// PENDING → RUNNING for the task behind `delivery`.
    ///
    /// `Ok(None)` when there is nothing to run: an unknown task leaves the
    /// message for redelivery, a task that already moved on has its message
    /// deleted.
    pub async fn claim(
        &self,
        queue: Arc<dyn DeliveryQueue>,
        delivery: Delivery,
    ) -> Result<Option<Claim>> {
        let task_id = delivery.message.task_id;
        let claim_id = self.ids.generate_claim_id();
        let expiration = self.clock.now() + to_chrono(self.heartbeat.lease);
        let update = TaskUpdate::claim(
            claim_id,
            self.worker_id.clone(),
            expiration,
            delivery.receive_count,
        );

        let claimed = self
            .retry
            .call("store", "compare_and_swap_status", || {
                self.store.compare_and_swap_status(
                    task_id,
                    TaskStatus::Pending,
                    TaskStatus::Running,
                    update.clone(),
                )
            })
            .await;

        match claimed {
            Ok(record) => {
                tracing::info!(
                    task_id = %task_id,
                    worker_id = %self.worker_id,
                    claim_id = %claim_id,
                    receive_count = delivery.receive_count,
                    "task claimed"
                );
                Ok(Some(Claim {
                    claim_id,
                    record,
                    delivery,
                    queue,
                }))
            }
            Err(GridError::NotFound(_)) => {
                tracing::warn!(
                    task_id = %task_id,
                    "message for unknown task, leaving it for redelivery"
                );
                Ok(None)
            }
            Err(e) if e.is_stale_state() => {
                tracing::debug!(
                    task_id = %task_id,
                    error = %e,
                    "task not claimable, dropping message"
                );
                self.delete_message(&queue, &delivery).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Push the heartbeat out by one lease and keep the message invisible.
    /// `StaleState` means the claim is gone.
    pub async fn renew(&self, claim: &Claim) -> Result<()> {
        let expiration = self.clock.now() + to_chrono(self.heartbeat.lease);
        self.retry
            .call("store", "compare_and_swap_status", || {
                self.store.compare_and_swap_status(
                    claim.task_id(),
                    TaskStatus::Running,
                    TaskStatus::Running,
                    TaskUpdate::renew(claim.claim_id, expiration),
                )
            })
            .await?;

        let visibility = self.visibility_timeout.max(self.heartbeat.lease);
        if let Err(e) = self
            .retry
            .call("queue", "change_visibility", || {
                claim
                    .queue
                    .change_visibility(&claim.delivery.receipt, visibility)
            })
            .await
        {
            // the task row is what counts; a redelivery will just lose the claim CAS
            tracing::warn!(
                task_id = %claim.task_id(),
                error = %e,
                "failed to extend message visibility"
            );
        }
        tracing::debug!(task_id = %claim.task_id(), "heartbeat renewed");
        Ok(())
    }

    /// Resolve the claimed task's payload.
    pub async fn load_input(&self, claim: &Claim) -> Result<TaskInput> {
        let record = &claim.record;
        let payload = match &record.payload {
            PayloadRef::Inline(bytes) => bytes.clone(),
            PayloadRef::External(blob) => {
                self.retry
                    .call("blob", "get", || self.blobs.get(blob))
                    .await?
            }
        };
        Ok(TaskInput {
            task_id: record.task_id,
            task_priority: record.task_priority,
            task_owner: record.task_owner.clone(),
            session_id: record.session_id.clone(),
            payload,
            receive_count: record.receive_count,
            retry_count: record.retry_count,
        })
    }

    /// RUNNING → COMPLETED with `result`, then acknowledge the message.
    pub async fn complete(&self, claim: &Claim, result: Vec<u8>) -> Result<TerminalWrite> {
        let offload = match self.policy.should_offload(result.len()) {
            Ok(offload) => offload,
            Err(e) => return self.fail(claim, format!("result rejected: {e}")).await,
        };
        let result = if offload {
            let key = result_key(claim.task_id());
            let blob = self
                .retry
                .call("blob", "put", || self.blobs.put(&key, result.clone()))
                .await?;
            PayloadRef::External(blob)
        } else {
            PayloadRef::Inline(result)
        };

        let update = TaskUpdate::none()
            .with_result(result.clone())
            .expecting_claim(claim.claim_id);
        let written = self.terminal_write(claim, TaskStatus::Completed, update).await?;
        if written == TerminalWrite::Superseded
            && let PayloadRef::External(blob) = &result
            && let Err(e) = self
                .retry
                .call("blob", "delete", || self.blobs.delete(blob))
                .await
        {
            tracing::warn!(key = %blob.key, error = %e, "failed to discard superseded result");
        }
        Ok(written)
    }

    /// RUNNING → FAILED with `error`, then acknowledge the message.
    pub async fn fail(&self, claim: &Claim, error: impl Into<String>) -> Result<TerminalWrite> {
        let update = TaskUpdate::none()
            .with_error(error)
            .expecting_claim(claim.claim_id);
        self.terminal_write(claim, TaskStatus::Failed, update).await
    }

    async fn terminal_write(
        &self,
        claim: &Claim,
        next: TaskStatus,
        update: TaskUpdate,
    ) -> Result<TerminalWrite> {
        let written = self
            .retry
            .call("store", "compare_and_swap_status", || {
                self.store.compare_and_swap_status(
                    claim.task_id(),
                    TaskStatus::Running,
                    next,
                    update.clone(),
                )
            })
            .await;

        let outcome = match written {
            Ok(record) => {
                tracing::info!(
                    task_id = %claim.task_id(),
                    status = %record.task_status,
                    "task finished"
                );
                TerminalWrite::Written(record.task_status)
            }
            Err(e) if e.is_stale_state() => {
                tracing::info!(
                    task_id = %claim.task_id(),
                    error = %e,
                    "claim lost, result discarded"
                );
                TerminalWrite::Superseded
            }
            Err(e) => return Err(e),
        };
        self.delete_message(&claim.queue, &claim.delivery).await;
        Ok(outcome)
    }

    async fn delete_message(&self, queue: &Arc<dyn DeliveryQueue>, delivery: &Delivery) {
        if let Err(e) = self
            .retry
            .call("queue", "delete", || queue.delete(&delivery.receipt))
            .await
        {
            // redelivery only costs a failed claim
            tracing::warn!(
                task_id = %delivery.message.task_id,
                error = %e,
                "failed to delete message"
            );
        }
    }

    /// Run `executor` while renewing the heartbeat every interval.
    /// `None` when the claim was lost mid-execution.
    async fn execute_with_heartbeat(
        &self,
        claim: &Claim,
        executor: &dyn TaskExecutor,
        input: &TaskInput,
    ) -> Option<std::result::Result<Vec<u8>, ExecutionError>> {
        let execution = executor.execute(input);
        tokio::pin!(execution);
        let period = self.heartbeat.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                outcome = &mut execution => return Some(outcome),
                _ = ticker.tick() => match self.renew(claim).await {
                    Ok(()) => {}
                    Err(e) if e.is_stale_state() => {
                        tracing::warn!(
                            task_id = %claim.task_id(),
                            "claim lost during execution, abandoning"
                        );
                        return None;
                    }
                    Err(e) => {
                        tracing::warn!(
                            task_id = %claim.task_id(),
                            error = %e,
                            "heartbeat renew failed"
                        );
                    }
                },
            }
        }
    }

    /// Handle at most one message. Returns whether a message was taken.
    pub async fn process_next(&self, executor: &dyn TaskExecutor) -> Result<bool> {
        let Some((queue, delivery)) = self.poll().await? else {
            return Ok(false);
        };
        let task_id = delivery.message.task_id;
        self.process_delivery(queue, delivery, executor)
            .instrument(task_span("execute", task_id))
            .await?;
        Ok(true)
    }

    async fn process_delivery(
        &self,
        queue: Arc<dyn DeliveryQueue>,
        delivery: Delivery,
        executor: &dyn TaskExecutor,
    ) -> Result<()> {
        let Some(claim) = self.claim(queue, delivery).await? else {
            return Ok(());
        };

        let input = match self.load_input(&claim).await {
            Ok(input) => input,
            // the sweeper requeues the task once the lease runs out
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                self.fail(&claim, format!("payload unavailable: {e}")).await?;
                return Ok(());
            }
        };

        match self.execute_with_heartbeat(&claim, executor, &input).await {
            Some(Ok(result)) => {
                self.complete(&claim, result).await?;
            }
            Some(Err(e)) => {
                self.fail(&claim, e.to_string()).await?;
            }
            None => self.delete_message(&claim.queue, &claim.delivery).await,
        }
        Ok(())
    }

    /// Poll until `shutdown` flips to `true`. In-flight executions finish first.
    pub async fn run(&self, executor: Arc<dyn TaskExecutor>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.process_next(executor.as_ref()).await {
                Ok(handled) => !handled,
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        "worker iteration failed"
                    );
                    true
                }
            };
            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.idle_wait) => {}
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }
}

/// Worker group handle.
/// - `request_shutdown` stops every worker after its current task
/// - `shutdown_and_join` also waits for them
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn one loop per agent, sharing `executor`.
    pub fn spawn(agents: Vec<WorkerAgent>, executor: Arc<dyn TaskExecutor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = agents
            .into_iter()
            .map(|agent| {
                let executor = Arc::clone(&executor);
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { agent.run(executor, rx).await })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}
