//! Task record: the lifecycle row stored in the task table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{GridError, Result};
use super::ids::{ClaimId, SessionId, TaskId, WorkerId};
use super::state::TaskStatus;

/// Where a payload or result lives.
///
/// Small bodies stay in the row; anything above the inline threshold is
/// written to the blob store first and only the reference is kept here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PayloadRef {
    Inline(Vec<u8>),
    External(BlobRef),
}

impl PayloadRef {
    pub fn is_external(&self) -> bool {
        matches!(self, PayloadRef::External(_))
    }

    pub fn size(&self) -> usize {
        match self {
            PayloadRef::Inline(bytes) => bytes.len(),
            PayloadRef::External(blob) => blob.size,
        }
    }
}

/// Reference into the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub key: String,
    pub size: usize,
}

/// The task row.
///
/// Design:
/// - One row per `task_id`, never deleted by normal operation.
/// - Every mutation goes through [`TaskRecord::compare_and_swap`], which is
///   the one place the conditional-update rules live. Backends call it under
///   their own atomicity (a lock, a conditional expression, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    pub task_priority: u32,
    pub task_owner: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Only set while RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_expiration_timestamp: Option<DateTime<Utc>>,

    pub payload: PayloadRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PayloadRef>,

    /// Failure or expiry reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Delivery count of the queue message that produced the current claim.
    pub receive_count: u32,

    /// Number of sweeper requeues so far.
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<ClaimId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new_pending(
        task: NewTask,
        payload: PayloadRef,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_status: TaskStatus::Pending,
            task_priority: task.priority,
            task_owner: task.owner,
            session_id: task.session_id,
            heartbeat_expiration_timestamp: None,
            payload,
            result: None,
            error: None,
            receive_count: 0,
            retry_count: 0,
            claim_id: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn stale(&self, expected: TaskStatus) -> GridError {
        GridError::StaleState {
            task_id: self.task_id,
            expected,
            actual: self.task_status,
        }
    }

    /// Apply a conditional status transition in place.
    ///
    /// Rejected with `StaleState` when:
    /// - the stored status is terminal,
    /// - the stored status differs from `expected`,
    /// - `update.expect_claim` does not match the current claim,
    /// - `update.expect_expired_before` is set and the heartbeat is not
    ///   older than it.
    ///
    /// On rejection the record is left untouched.
    pub fn compare_and_swap(
        &mut self,
        expected: TaskStatus,
        next: TaskStatus,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.task_status.is_terminal() || self.task_status != expected {
            return Err(self.stale(expected));
        }
        if let Some(claim) = update.expect_claim
            && self.claim_id != Some(claim)
        {
            return Err(self.stale(expected));
        }
        if let Some(deadline) = update.expect_expired_before {
            match self.heartbeat_expiration_timestamp {
                Some(expiration) if expiration < deadline => {}
                _ => return Err(self.stale(expected)),
            }
        }
        if !expected.can_transition_to(next) {
            return Err(GridError::InvalidRequest(format!(
                "{expected} -> {next} is not a valid transition"
            )));
        }
        if next == TaskStatus::Running
            && update.heartbeat_expiration.is_none()
            && self.heartbeat_expiration_timestamp.is_none()
        {
            return Err(GridError::InvalidRequest(
                "RUNNING requires a heartbeat expiration".to_string(),
            ));
        }

        self.task_status = next;
        self.updated_at = now;

        match next {
            TaskStatus::Running => {
                if let Some(expiration) = update.heartbeat_expiration {
                    self.heartbeat_expiration_timestamp = Some(expiration);
                }
                if let Some((claim_id, worker_id)) = update.claim {
                    self.claim_id = Some(claim_id);
                    self.worker_id = Some(worker_id);
                }
                if let Some(count) = update.receive_count {
                    self.receive_count = count;
                }
            }
            TaskStatus::Pending => {
                self.heartbeat_expiration_timestamp = None;
                self.claim_id = None;
                self.worker_id = None;
            }
            _ => {
                // terminal: keep claim/worker for audit, drop the heartbeat
                self.heartbeat_expiration_timestamp = None;
            }
        }

        if update.increment_retry {
            self.retry_count = self.retry_count.saturating_add(1);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        Ok(())
    }

    pub fn expiry_entry(&self) -> Option<ExpiryIndexEntry> {
        self.heartbeat_expiration_timestamp
            .map(|expiration| ExpiryIndexEntry {
                task_id: self.task_id,
                task_status: self.task_status,
                heartbeat_expiration_timestamp: expiration,
                task_owner: self.task_owner.clone(),
                task_priority: self.task_priority,
                receive_count: self.receive_count,
                retry_count: self.retry_count,
            })
    }

    pub fn session_entry(&self) -> Option<SessionIndexEntry> {
        self.session_id.as_ref().map(|session_id| SessionIndexEntry {
            session_id: session_id.clone(),
            task_status: self.task_status,
            task_id: self.task_id,
        })
    }
}

/// Caller-supplied part of a new task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub priority: u32,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Field changes and extra guards carried by a conditional transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub heartbeat_expiration: Option<DateTime<Utc>>,
    pub claim: Option<(ClaimId, WorkerId)>,
    pub receive_count: Option<u32>,
    pub result: Option<PayloadRef>,
    pub error: Option<String>,
    pub increment_retry: bool,

    /// Guard: the write belongs to this claim.
    pub expect_claim: Option<ClaimId>,

    /// Guard: the stored heartbeat is strictly older than this instant.
    pub expect_expired_before: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn claim(
        claim_id: ClaimId,
        worker_id: WorkerId,
        heartbeat_expiration: DateTime<Utc>,
        receive_count: u32,
    ) -> Self {
        Self {
            heartbeat_expiration: Some(heartbeat_expiration),
            claim: Some((claim_id, worker_id)),
            receive_count: Some(receive_count),
            ..Self::default()
        }
    }

    pub fn renew(claim_id: ClaimId, heartbeat_expiration: DateTime<Utc>) -> Self {
        Self {
            heartbeat_expiration: Some(heartbeat_expiration),
            expect_claim: Some(claim_id),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: PayloadRef) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn expecting_claim(mut self, claim_id: ClaimId) -> Self {
        self.expect_claim = Some(claim_id);
        self
    }
}

/// Projection of index 1 (`task_status`, `heartbeat_expiration_timestamp`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryIndexEntry {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    pub heartbeat_expiration_timestamp: DateTime<Utc>,
    pub task_owner: String,
    pub task_priority: u32,
    pub receive_count: u32,
    pub retry_count: u32,
}

impl ExpiryIndexEntry {
    /// Deliveries used so far.
    ///
    /// Each sweeper requeue sends a fresh queue message whose receive count
    /// starts over, so the requeue count is taken when it is higher.
    pub fn deliveries(&self) -> u32 {
        self.receive_count.max(self.retry_count)
    }
}

/// Projection of index 2 (`session_id`, `task_status`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub session_id: SessionId,
    pub task_status: TaskStatus,
    pub task_id: TaskId,
}
