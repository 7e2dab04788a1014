//! DeliveryQueue port - 配送キュー（SQS 相当 / InMemory）
//!
//! DeliveryQueue は `{task_id, task_priority}` のみを流します（状態や payload は含まない）。
//!
//! # 配送セマンティクス
//! - at-least-once: 受信したメッセージは visibility timeout の間だけ見えなくなる
//! - ack = `delete`。削除されなければ timeout 後に再配送される
//! - 受信回数が上限を超えたメッセージは dead-letter queue へ移動
//! - 保持期間（retention）を過ぎたメッセージは破棄
//!
//! 優先度ごとのシャードは [`QueueRouter`] で引きます。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Result, TaskId};

/// Body of a queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub task_priority: u32,
}

/// Handle used to acknowledge or extend one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(pub String);

/// A message as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: ReceiptHandle,
    pub message: TaskMessage,
    /// 1 on first delivery.
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
}

/// Visible / in-flight message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
}

/// DeliveryQueue は task_id を配送するためのキュー（1 シャード分）
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: TaskMessage) -> Result<()>;

    /// Receive one message, waiting up to `wait` when nothing is visible.
    /// The message stays invisible for the queue's visibility timeout.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery. Deleting an unknown or stale receipt is a no-op.
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<()>;

    /// Push the visibility deadline of an in-flight delivery out by `timeout`.
    async fn change_visibility(&self, receipt: &ReceiptHandle, timeout: Duration) -> Result<()>;

    async fn depth(&self) -> Result<QueueDepth>;
}

/// Shard lookup by priority class.
pub trait QueueRouter: Send + Sync {
    /// The shard a task of `priority` is sent to.
    fn shard_for(&self, priority: u32) -> Arc<dyn DeliveryQueue>;

    /// All shards, most urgent first (the order workers poll them in).
    fn shards_by_urgency(&self) -> Vec<Arc<dyn DeliveryQueue>>;

    fn dead_letter(&self) -> Arc<dyn DeliveryQueue>;
}

/// Fixed, statically configured shard set.
///
/// Shard `i` serves priority class `i`; larger numbers are more urgent.
/// Priorities above the highest configured class go to the top shard.
pub struct PriorityShards {
    shards: Vec<Arc<dyn DeliveryQueue>>,
    dead_letter: Arc<dyn DeliveryQueue>,
}

impl PriorityShards {
    /// `shards` must be non-empty; index = priority class.
    pub fn new(
        shards: Vec<Arc<dyn DeliveryQueue>>,
        dead_letter: Arc<dyn DeliveryQueue>,
    ) -> Result<Self> {
        if shards.is_empty() {
            return Err(crate::domain::GridError::Config(
                "at least one priority shard is required".to_string(),
            ));
        }
        Ok(Self {
            shards,
            dead_letter,
        })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl QueueRouter for PriorityShards {
    fn shard_for(&self, priority: u32) -> Arc<dyn DeliveryQueue> {
        let index = (priority as usize).min(self.shards.len() - 1);
        Arc::clone(&self.shards[index])
    }

    fn shards_by_urgency(&self) -> Vec<Arc<dyn DeliveryQueue>> {
        self.shards.iter().rev().cloned().collect()
    }

    fn dead_letter(&self) -> Arc<dyn DeliveryQueue> {
        Arc::clone(&self.dead_letter)
    }
}

/// Shard name for a priority class, e.g. `task_queue__0`.
pub fn shard_name(base: &str, priority: u32) -> String {
    format!("{base}__{priority}")
}
