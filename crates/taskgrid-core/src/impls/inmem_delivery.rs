//! InMemoryDeliveryQueue - 開発用の配送キュー（1 シャード分）
//!
//! # 実装詳細
//! - `BTreeMap<seq, StoredMessage>` で送信順を保持
//! - visibility timeout / 受信回数 / retention は Clock 基準で判定
//! - 受信回数の上限を超えたメッセージは dead-letter queue に移す
//! - `receive` の待機は `Notify` で send 時に起こされる

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{GridError, Result};
use crate::ports::{
    Clock, Delivery, DeliveryQueue, QueueDepth, ReceiptHandle, TaskMessage, to_chrono,
};

/// Per-queue delivery settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub retention: Duration,
    /// Deliveries allowed before diversion to the dead-letter queue.
    /// `None` disables diversion (used for the dead-letter queue itself).
    pub max_receive_count: Option<u32>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(40),
            retention: Duration::from_secs(1_209_600),
            max_receive_count: Some(5),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: TaskMessage,
    sent_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    receive_count: u32,
    receipt: Option<String>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    messages: BTreeMap<u64, StoredMessage>,
}

fn receipt_for(seq: u64, receive_count: u32) -> String {
    format!("{seq}:{receive_count}")
}

fn seq_of(receipt: &ReceiptHandle) -> Option<u64> {
    receipt.0.split_once(':').and_then(|(seq, _)| seq.parse().ok())
}

/// InMemoryDeliveryQueue は開発用の配送キュー
///
/// # 使用例
/// ```ignore
/// let queue = InMemoryDeliveryQueue::new("task_queue__0", QueueSettings::default(), clock);
/// queue.send(message).await?;
/// let delivery = queue.receive(Duration::from_secs(1)).await?;
/// ```
pub struct InMemoryDeliveryQueue {
    name: String,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    dead_letter: Option<Arc<dyn DeliveryQueue>>,
    state: Mutex<QueueState>,
    notify: Notify,
    failing_sends: AtomicU32,
}

impl InMemoryDeliveryQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            dead_letter: None,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            failing_sends: AtomicU32::new(0),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn DeliveryQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Make the next `n` sends fail with a transient error.
    pub fn inject_send_failures(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Snapshot of all retained message bodies, in send order.
    pub async fn peek_all(&self) -> Vec<TaskMessage> {
        let state = self.state.lock().await;
        state.messages.values().map(|m| m.message).collect()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// One non-blocking receive attempt. Returns the delivery (if any) and the
    /// messages that exhausted their deliveries and must be dead-lettered.
    ///
    /// Diverted messages are taken out of the queue so no other receiver
    /// diverts them twice; [`Self::restore`] puts back any the dead-letter
    /// queue did not accept.
    async fn try_receive(&self) -> (Option<Delivery>, Vec<(u64, StoredMessage)>) {
        let now = self.clock.now();
        let retention = to_chrono(self.settings.retention);
        let visibility = to_chrono(self.settings.visibility_timeout);
        let mut state = self.state.lock().await;

        state.messages.retain(|_, m| m.sent_at + retention > now);

        let mut diverted_seqs = Vec::new();
        let mut picked = None;
        for (seq, stored) in state.messages.iter() {
            if stored.visible_at > now {
                continue;
            }
            if let Some(max) = self.settings.max_receive_count
                && self.dead_letter.is_some()
                && stored.receive_count >= max
            {
                diverted_seqs.push(*seq);
                continue;
            }
            picked = Some(*seq);
            break;
        }

        let diverted = diverted_seqs
            .iter()
            .filter_map(|seq| state.messages.remove(seq).map(|m| (*seq, m)))
            .collect();

        let delivery = picked.and_then(|seq| {
            let stored = state.messages.get_mut(&seq)?;
            stored.receive_count += 1;
            stored.visible_at = now + visibility;
            let receipt = receipt_for(seq, stored.receive_count);
            stored.receipt = Some(receipt.clone());
            Some(Delivery {
                receipt: ReceiptHandle(receipt),
                message: stored.message,
                receive_count: stored.receive_count,
                sent_at: stored.sent_at,
            })
        });
        (delivery, diverted)
    }

    async fn restore(&self, messages: impl IntoIterator<Item = (u64, StoredMessage)>) {
        let mut state = self.state.lock().await;
        for (seq, stored) in messages {
            state.messages.insert(seq, stored);
        }
    }

    /// Send `diverted` to the dead-letter queue in order. On the first failure
    /// that message and the rest go back to this queue.
    async fn move_to_dead_letter(&self, diverted: Vec<(u64, StoredMessage)>) -> Result<()> {
        if diverted.is_empty() {
            return Ok(());
        }
        let Some(dead_letter) = &self.dead_letter else {
            self.restore(diverted).await;
            return Ok(());
        };
        let mut pending = diverted.into_iter();
        while let Some((seq, stored)) = pending.next() {
            tracing::warn!(
                queue = %self.name,
                dead_letter = dead_letter.name(),
                task_id = %stored.message.task_id,
                receive_count = stored.receive_count,
                "message exceeded max receive count, moving to dead-letter queue"
            );
            if let Err(e) = dead_letter.send(stored.message).await {
                self.restore(std::iter::once((seq, stored)).chain(pending)).await;
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: TaskMessage) -> Result<()> {
        if self.take_injected_failure() {
            return Err(GridError::transient("queue", format!("send to {} failed", self.name)));
        }
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.messages.insert(
                seq,
                StoredMessage {
                    message,
                    sent_at: now,
                    visible_at: now,
                    receive_count: 0,
                    receipt: None,
                },
            );
        }
        // Notify outside the lock
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let (delivery, diverted) = self.try_receive().await;
            if let Err(e) = self.move_to_dead_letter(diverted).await {
                // 配送済みのメッセージは返す。DLQ への移動は次の receive でやり直す
                if delivery.is_none() {
                    return Err(e);
                }
                tracing::warn!(
                    queue = %self.name,
                    error = %e,
                    "dead-letter send failed, will retry"
                );
            }
            if delivery.is_some() {
                return Ok(delivery);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(deadline) => {},
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<()> {
        let Some(seq) = seq_of(receipt) else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        let matches = state
            .messages
            .get(&seq)
            .is_some_and(|m| m.receipt.as_deref() == Some(receipt.0.as_str()));
        if matches {
            state.messages.remove(&seq);
        }
        Ok(())
    }

    async fn change_visibility(&self, receipt: &ReceiptHandle, timeout: Duration) -> Result<()> {
        let Some(seq) = seq_of(receipt) else {
            return Ok(());
        };
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some(stored) = state.messages.get_mut(&seq)
            && stored.receipt.as_deref() == Some(receipt.0.as_str())
        {
            stored.visible_at = now + to_chrono(timeout);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut depth = QueueDepth::default();
        for stored in state.messages.values() {
            if stored.visible_at <= now {
                depth.visible += 1;
            } else {
                depth.in_flight += 1;
            }
        }
        Ok(depth)
    }
}
