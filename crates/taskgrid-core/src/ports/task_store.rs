//! TaskStore port - タスク表（正本 / source of truth）
//!
//! TaskStore は以下を管理します：
//! - 状態（TaskStatus）と heartbeat 期限
//! - payload / result（inline または blob 参照）
//! - 2 つのセカンダリインデックス
//!   - (task_status, heartbeat_expiration_timestamp): TTL checker 用
//!   - (session_id, task_status): バッチ進捗用
//!
//! # 設計原則
//! - 無条件の上書きは存在しない。状態の変更は `compare_and_swap_status` のみ
//! - 期待値の不一致は `GridError::StaleState`（リトライ禁止）
//! - クエリはページング付きの範囲スキャン（全件スキャンはしない）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ExpiryIndexEntry, Result, SessionId, SessionIndexEntry, TaskId, TaskRecord, TaskStatus,
    TaskUpdate,
};

/// Opaque continuation token returned by a paginated query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub String);

/// Upper bound and resume point of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub after: Option<PageToken>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { limit, after: None }
    }

    pub fn next(limit: usize, token: PageToken) -> Self {
        Self {
            limit,
            after: Some(token),
        }
    }
}

/// One page of query results; `next` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// TaskStore はタスク表の抽象
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record; `AlreadyExists` when the id is taken.
    async fn put_if_absent(&self, record: TaskRecord) -> Result<()>;

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>>;

    /// Atomically move `task_id` from `expected` to `next`, applying `update`.
    ///
    /// Returns the record as written. `NotFound` when the id is unknown,
    /// `StaleState` when the stored status (or one of the update's guards)
    /// does not match at write time.
    async fn compare_and_swap_status(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        update: TaskUpdate,
    ) -> Result<TaskRecord>;

    /// Range scan over index 1: entries with `task_status == status` and
    /// `heartbeat_expiration_timestamp < before`, oldest first.
    async fn query_by_status_and_expiry(
        &self,
        status: TaskStatus,
        before: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<ExpiryIndexEntry>>;

    /// Range scan over index 2: all tasks of a session, optionally
    /// restricted to one status.
    async fn query_by_session(
        &self,
        session_id: &SessionId,
        status: Option<TaskStatus>,
        page: PageRequest,
    ) -> Result<Page<SessionIndexEntry>>;
}
