//! LruResultCache - 結果読み出し用の LRU キャッシュ（Redis 相当）
//!
//! # 実装詳細
//! - `HashMap` に本体と利用順の seq、`BTreeMap<seq, TaskId>` に利用順（先頭が最も古い）
//! - 参照のたびに新しい seq を振り直す。touch / remove / evict はいずれも O(log n)
//! - 容量超過時は最も古いエントリを追い出す
//! - TTL は Clock 基準。期限切れは get 時に消す

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Result, TaskId};
use crate::ports::{CachedResult, Clock, ResultCache, to_chrono};

struct CacheEntry {
    value: CachedResult,
    expires_at: DateTime<Utc>,
    /// Key of this entry in `CacheState::recency`.
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<TaskId, CacheEntry>,
    recency: BTreeMap<u64, TaskId>,
    next_seq: u64,
}

impl CacheState {
    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn touch(&mut self, task_id: TaskId) {
        let seq = self.bump();
        if let Some(entry) = self.entries.get_mut(&task_id) {
            self.recency.remove(&entry.seq);
            entry.seq = seq;
            self.recency.insert(seq, task_id);
        }
    }

    fn insert(&mut self, value: CachedResult, expires_at: DateTime<Utc>) {
        let task_id = value.task_id;
        let seq = self.bump();
        let previous = self.entries.insert(
            task_id,
            CacheEntry {
                value,
                expires_at,
                seq,
            },
        );
        if let Some(previous) = previous {
            self.recency.remove(&previous.seq);
        }
        self.recency.insert(seq, task_id);
    }

    fn remove(&mut self, task_id: TaskId) {
        if let Some(entry) = self.entries.remove(&task_id) {
            self.recency.remove(&entry.seq);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        match self.recency.pop_first() {
            Some((_, oldest)) => {
                self.entries.remove(&oldest);
                true
            }
            None => false,
        }
    }
}

pub struct LruResultCache {
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl LruResultCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            ttl,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

#[async_trait]
impl ResultCache for LruResultCache {
    async fn get(&self, task_id: TaskId) -> Result<Option<CachedResult>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let expired = match state.entries.get(&task_id) {
            None => return Ok(None),
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            state.remove(task_id);
            return Ok(None);
        }
        state.touch(task_id);
        Ok(state.entries.get(&task_id).map(|entry| entry.value.clone()))
    }

    async fn put(&self, entry: CachedResult) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let expires_at = self.clock.now() + to_chrono(self.ttl);
        let mut state = self.state.lock().await;
        state.insert(entry, expires_at);
        while state.entries.len() > self.capacity {
            if !state.evict_oldest() {
                break;
            }
        }
        Ok(())
    }

    async fn invalidate(&self, task_id: TaskId) -> Result<()> {
        self.state.lock().await.remove(task_id);
        Ok(())
    }
}
