//! InMemoryTaskStore - 開発・テスト用のタスク表
//!
//! # 実装詳細
//! - `HashMap<TaskId, TaskRecord>` が本体
//! - 2 つのインデックスは `BTreeSet` で保持し、書き込みのたびに同じロック内で更新
//! - 条件付き遷移のルールは `TaskRecord::compare_and_swap` に委譲

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::domain::{
    ExpiryIndexEntry, GridError, Result, SessionId, SessionIndexEntry, TaskId, TaskRecord,
    TaskStatus, TaskUpdate,
};
use crate::observability::StatusCounts;
use crate::ports::{Clock, Page, PageRequest, PageToken, TaskStore};

type ExpiryKey = (TaskStatus, i64, TaskId);
type SessionKey = (SessionId, TaskStatus, TaskId);

#[derive(Default)]
struct StoreState {
    records: HashMap<TaskId, TaskRecord>,
    by_expiry: BTreeSet<ExpiryKey>,
    by_session: BTreeSet<SessionKey>,
}

impl StoreState {
    fn unindex(&mut self, record: &TaskRecord) {
        if let Some(key) = expiry_key(record) {
            self.by_expiry.remove(&key);
        }
        if let Some(key) = session_key(record) {
            self.by_session.remove(&key);
        }
    }

    fn index(&mut self, record: &TaskRecord) {
        if let Some(key) = expiry_key(record) {
            self.by_expiry.insert(key);
        }
        if let Some(key) = session_key(record) {
            self.by_session.insert(key);
        }
    }
}

fn expiry_key(record: &TaskRecord) -> Option<ExpiryKey> {
    record
        .heartbeat_expiration_timestamp
        .map(|expiration| (record.task_status, expiration.timestamp_millis(), record.task_id))
}

fn session_key(record: &TaskRecord) -> Option<SessionKey> {
    record
        .session_id
        .clone()
        .map(|session| (session, record.task_status, record.task_id))
}

fn min_task_id() -> TaskId {
    TaskId::from_ulid(Ulid::nil())
}

fn max_task_id() -> TaskId {
    TaskId::from_ulid(Ulid::from(u128::MAX))
}

fn bad_token(token: &PageToken) -> GridError {
    GridError::InvalidRequest(format!("malformed page token: {}", token.0))
}

fn encode_expiry_token(ms: i64, task_id: TaskId) -> PageToken {
    PageToken(format!("{ms}:{}", task_id.as_ulid()))
}

fn decode_expiry_token(token: &PageToken) -> Result<(i64, TaskId)> {
    let (ms, id) = token.0.split_once(':').ok_or_else(|| bad_token(token))?;
    let ms = ms.parse::<i64>().map_err(|_| bad_token(token))?;
    let id = id.parse::<TaskId>().map_err(|_| bad_token(token))?;
    Ok((ms, id))
}

fn encode_session_token(status: TaskStatus, task_id: TaskId) -> PageToken {
    PageToken(format!("{status}:{}", task_id.as_ulid()))
}

fn decode_session_token(token: &PageToken) -> Result<(TaskStatus, TaskId)> {
    let (status, id) = token.0.split_once(':').ok_or_else(|| bad_token(token))?;
    let status = status.parse::<TaskStatus>().map_err(|_| bad_token(token))?;
    let id = id.parse::<TaskId>().map_err(|_| bad_token(token))?;
    Ok((status, id))
}

/// InMemoryTaskStore は単一プロセス内のタスク表
///
/// # 制限
/// - 永続化なし、プロセスをまたいで共有できない
pub struct InMemoryTaskStore {
    state: RwLock<StoreState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// Count of records per status (observability).
    pub async fn counts_by_status(&self) -> StatusCounts {
        let state = self.state.read().await;
        state.records.values().map(|r| r.task_status).collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put_if_absent(&self, record: TaskRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.task_id) {
            return Err(GridError::AlreadyExists(record.task_id));
        }
        state.index(&record);
        state.records.insert(record.task_id, record);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let state = self.state.read().await;
        Ok(state.records.get(&task_id).cloned())
    }

    async fn compare_and_swap_status(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        update: TaskUpdate,
    ) -> Result<TaskRecord> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let Some(current) = state.records.get(&task_id) else {
            return Err(GridError::NotFound(task_id));
        };

        // 候補に適用してから差し替える（失敗時は元の記録もインデックスも無傷）
        let mut candidate = current.clone();
        candidate.compare_and_swap(expected, next, update, now)?;

        let previous = current.clone();
        state.unindex(&previous);
        state.index(&candidate);
        state.records.insert(task_id, candidate.clone());
        Ok(candidate)
    }

    async fn query_by_status_and_expiry(
        &self,
        status: TaskStatus,
        before: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<ExpiryIndexEntry>> {
        let state = self.state.read().await;

        let start = match &page.after {
            Some(token) => {
                let (ms, id) = decode_expiry_token(token)?;
                Bound::Excluded((status, ms, id))
            }
            None => Bound::Included((status, i64::MIN, min_task_id())),
        };
        // ミリ秒で粗く切ってから、正確な時刻で絞り込む
        let end = Bound::Included((status, before.timestamp_millis(), max_task_id()));

        let mut items = Vec::new();
        let mut last_key = None;
        let mut has_more = false;
        for key in state.by_expiry.range((start, end)) {
            if items.len() == page.limit {
                has_more = true;
                break;
            }
            last_key = Some(*key);
            let Some(entry) = state
                .records
                .get(&key.2)
                .and_then(TaskRecord::expiry_entry)
            else {
                continue;
            };
            if entry.heartbeat_expiration_timestamp < before {
                items.push(entry);
            }
        }

        let next = match (has_more, last_key) {
            (true, Some((_, ms, id))) => Some(encode_expiry_token(ms, id)),
            _ => None,
        };
        Ok(Page { items, next })
    }

    async fn query_by_session(
        &self,
        session_id: &SessionId,
        status: Option<TaskStatus>,
        page: PageRequest,
    ) -> Result<Page<SessionIndexEntry>> {
        let state = self.state.read().await;

        let (low_status, high_status) = match status {
            Some(status) => (status, status),
            None => (TaskStatus::Pending, TaskStatus::Expired),
        };
        let start = match &page.after {
            Some(token) => {
                let (status, id) = decode_session_token(token)?;
                Bound::Excluded((session_id.clone(), status, id))
            }
            None => Bound::Included((session_id.clone(), low_status, min_task_id())),
        };
        let end = Bound::Included((session_id.clone(), high_status, max_task_id()));

        let mut items = Vec::new();
        let mut has_more = false;
        for (session, status, task_id) in state.by_session.range((start, end)) {
            if items.len() == page.limit {
                has_more = true;
                break;
            }
            items.push(SessionIndexEntry {
                session_id: session.clone(),
                task_status: *status,
                task_id: *task_id,
            });
        }

        let next = if has_more {
            items
                .last()
                .map(|entry| encode_session_token(entry.task_status, entry.task_id))
        } else {
            None
        };
        Ok(Page { items, next })
    }
}
