//! TtlChecker - heartbeat 期限切れタスクの回収（定期実行）
//!
//! # 1 回の走査
//! - インデックス 1 を (RUNNING, expiration < now) でページング
//! - 配送回数（`max(receive_count, retry_count)`）が `QUEUE_MAX_RECEIVE_COUNT` 未満なら
//!   RUNNING→PENDING（retry_count + 1）して元のシャードへ再送
//! - 上限に達していれば RUNNING→EXPIRED（再送しない）
//!
//! どの遷移も `expect_expired_before = now` 付きの条件付き書き込み。
//! 走査と書き込みの間に heartbeat が更新されたタスクは `StaleState` になり、
//! 数えるだけで無視する。
//! 複数の TtlChecker が同時に走っても同じタスクを二重に回収しない。

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::config::SweeperSettings;
use crate::app::retry::RetryPolicy;
use crate::domain::{ExpiryIndexEntry, GridError, Result, TaskRecord, TaskStatus, TaskUpdate};
use crate::metrics::GridMetrics;
use crate::ports::{Clock, PageRequest, QueueRouter, TaskMessage, TaskStore};

/// Counters for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub requeued: usize,
    pub expired: usize,
    /// Entries another actor moved first (renewed, cancelled, swept).
    pub superseded: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        self.scanned == 0
    }
}

enum Swept {
    Requeued,
    Expired,
    Superseded,
}

pub struct TtlChecker {
    store: Arc<dyn TaskStore>,
    router: Arc<dyn QueueRouter>,
    clock: Arc<dyn Clock>,
    settings: SweeperSettings,
    max_receive_count: u32,
    retry: RetryPolicy,
    metrics: GridMetrics,
}

impl TtlChecker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        router: Arc<dyn QueueRouter>,
        clock: Arc<dyn Clock>,
        settings: SweeperSettings,
        max_receive_count: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            router,
            clock,
            settings,
            max_receive_count,
            retry,
            metrics: GridMetrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: GridMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// One full pass over the stale RUNNING tasks.
    ///
    /// Per-task failures are counted in the report. Only a failing index
    /// query aborts the pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let swept = self.sweep_pages().await;
        self.metrics.record_request("ttl_checker", &swept, started.elapsed());
        if let Ok(report) = &swept {
            self.metrics.record_sweep(report);
        }
        swept
    }

    async fn sweep_pages(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let page_size = self.settings.page_size.max(1);
        let mut report = SweepReport::default();
        let mut page = PageRequest::first(page_size);

        loop {
            let entries = self
                .retry
                .call("store", "query_by_status_and_expiry", || {
                    self.store
                        .query_by_status_and_expiry(TaskStatus::Running, now, page.clone())
                })
                .await?;

            for entry in &entries.items {
                report.scanned += 1;
                match self.sweep_entry(entry, now).await {
                    Ok(Swept::Requeued) => report.requeued += 1,
                    Ok(Swept::Expired) => report.expired += 1,
                    Ok(Swept::Superseded) => report.superseded += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            task_id = %entry.task_id,
                            error = %e,
                            "sweep failed for task"
                        );
                    }
                }
            }

            match entries.next {
                Some(token) => page = PageRequest::next(page_size, token),
                None => break,
            }
        }

        if report.is_idle() {
            tracing::debug!("ttl sweep found nothing");
        } else {
            tracing::info!(
                scanned = report.scanned,
                requeued = report.requeued,
                expired = report.expired,
                superseded = report.superseded,
                failed = report.failed,
                "ttl sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_entry(&self, entry: &ExpiryIndexEntry, now: DateTime<Utc>) -> Result<Swept> {
        let task_id = entry.task_id;
        let deliveries = entry.deliveries();
        let requeue = deliveries < self.max_receive_count;
        let (next, update) = if requeue {
            let update = TaskUpdate {
                increment_retry: true,
                expect_expired_before: Some(now),
                ..TaskUpdate::none()
            };
            (TaskStatus::Pending, update)
        } else {
            let update = TaskUpdate {
                expect_expired_before: Some(now),
                ..TaskUpdate::none()
            }
            .with_error(format!(
                "heartbeat expired after {deliveries} deliveries ({} requeues)",
                entry.retry_count
            ));
            (TaskStatus::Expired, update)
        };

        let written = self
            .retry
            .call("store", "compare_and_swap_status", || {
                self.store
                    .compare_and_swap_status(task_id, TaskStatus::Running, next, update.clone())
            })
            .await;
        let record = match written {
            Ok(record) => record,
            Err(e) if e.is_stale_state() => {
                tracing::debug!(task_id = %task_id, "task moved before the sweep reached it");
                return Ok(Swept::Superseded);
            }
            Err(e) => return Err(e),
        };

        if !requeue {
            tracing::warn!(
                task_id = %task_id,
                deliveries,
                retry_count = record.retry_count,
                "task expired"
            );
            return Ok(Swept::Expired);
        }

        self.enqueue(&record).await?;
        tracing::info!(
            task_id = %task_id,
            retry_count = record.retry_count,
            priority = record.task_priority,
            "stale task requeued"
        );
        Ok(Swept::Requeued)
    }

    /// Re-send a requeued task; when that keeps failing, fail the task so it
    /// is not left PENDING without a queue entry.
    async fn enqueue(&self, record: &TaskRecord) -> Result<()> {
        let shard = self.router.shard_for(record.task_priority);
        let message = TaskMessage {
            task_id: record.task_id,
            task_priority: record.task_priority,
        };
        let Err(cause) = self
            .retry
            .call("queue", "send", || shard.send(message))
            .await
        else {
            return Ok(());
        };

        let update = TaskUpdate::none().with_error(format!("requeue failed: {cause}"));
        match self
            .retry
            .call("store", "compare_and_swap_status", || {
                self.store.compare_and_swap_status(
                    record.task_id,
                    TaskStatus::Pending,
                    TaskStatus::Failed,
                    update.clone(),
                )
            })
            .await
        {
            Ok(_) => self.metrics.record_rollback("ttl_checker"),
            Err(GridError::StaleState { .. }) => {}
            Err(e) => tracing::error!(
                task_id = %record.task_id,
                error = %e,
                "could not fail task after requeue failure, task left PENDING until redispatched"
            ),
        }
        Err(cause)
    }

    /// Sweep every `settings.interval` until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = self.settings.interval.as_secs(), "ttl checker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    // sender dropped: nobody can ask us to stop any more
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "ttl sweep aborted");
                    }
                }
            }
        }
        tracing::info!("ttl checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimId, NewTask, PayloadRef, TaskId, WorkerId};
    use crate::metrics::testing::CapturingRecorder;
    use crate::impls::{InMemoryDeliveryQueue, InMemoryTaskStore, QueueSettings};
    use crate::ports::{DeliveryQueue, FixedClock, PriorityShards};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;
    use ulid::Ulid;

    struct Fixture {
        checker: TtlChecker,
        store: Arc<InMemoryTaskStore>,
        shard: Arc<InMemoryDeliveryQueue>,
        clock: Arc<FixedClock>,
    }

    fn fixture(max_receive_count: u32, page_size: usize) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let shard = Arc::new(InMemoryDeliveryQueue::new(
            "q__0",
            QueueSettings::default(),
            clock.clone(),
        ));
        let dlq = Arc::new(InMemoryDeliveryQueue::new(
            "dlq",
            QueueSettings::default(),
            clock.clone(),
        ));
        let shards = vec![shard.clone() as Arc<dyn DeliveryQueue>];
        let router = PriorityShards::new(shards, dlq).unwrap();
        let checker = TtlChecker::new(
            store.clone(),
            Arc::new(router),
            clock.clone(),
            SweeperSettings {
                interval: Duration::from_secs(60),
                page_size,
            },
            max_receive_count,
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
        );
        Fixture {
            checker,
            store,
            shard,
            clock,
        }
    }

    /// PENDING → RUNNING with a 30 s lease, first delivery.
    async fn running(f: &Fixture) -> (TaskId, ClaimId) {
        running_on_delivery(f, 1).await
    }

    async fn running_on_delivery(f: &Fixture, receive_count: u32) -> (TaskId, ClaimId) {
        let task_id = TaskId::from_ulid(Ulid::new());
        let task = NewTask {
            priority: 0,
            owner: "alice".to_string(),
            session_id: None,
        };
        let record =
            TaskRecord::new_pending(task, PayloadRef::Inline(vec![]), task_id, f.clock.now());
        f.store.put_if_absent(record).await.unwrap();
        let claim_id = ClaimId::from_ulid(Ulid::new());
        claim(f, task_id, claim_id, receive_count).await;
        (task_id, claim_id)
    }

    async fn claim(f: &Fixture, task_id: TaskId, claim_id: ClaimId, receive_count: u32) {
        f.store
            .compare_and_swap_status(
                task_id,
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskUpdate::claim(
                    claim_id,
                    WorkerId::new("w-1"),
                    f.clock.now() + ChronoDuration::seconds(30),
                    receive_count,
                ),
            )
            .await
            .unwrap();
    }

    async fn status(f: &Fixture, task_id: TaskId) -> TaskStatus {
        f.store.get(task_id).await.unwrap().unwrap().task_status
    }

    #[tokio::test]
    async fn fresh_heartbeats_are_not_touched() {
        let f = fixture(3, 10);
        let (task_id, _) = running(&f).await;

        let report = f.checker.sweep_once().await.unwrap();
        assert!(report.is_idle());
        assert_eq!(status(&f, task_id).await, TaskStatus::Running);
    }

    #[tokio::test]
    async fn stale_task_is_requeued_on_its_shard() {
        let f = fixture(3, 10);
        let (task_id, _) = running(&f).await;
        f.clock.advance(ChronoDuration::seconds(31));

        let report = f.checker.sweep_once().await.unwrap();
        assert_eq!(report.requeued, 1);

        let record = f.store.get(task_id).await.unwrap().unwrap();
        assert_eq!(record.task_status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.claim_id.is_none());
        assert!(record.heartbeat_expiration_timestamp.is_none());
        assert_eq!(f.shard.peek_all().await[0].task_id, task_id);
    }

    #[tokio::test]
    async fn exhausted_task_expires_without_enqueue() {
        let f = fixture(0, 10);
        let (task_id, _) = running(&f).await;
        f.clock.advance(ChronoDuration::seconds(31));

        let report = f.checker.sweep_once().await.unwrap();
        assert_eq!(report.expired, 1);

        let record = f.store.get(task_id).await.unwrap().unwrap();
        assert_eq!(record.task_status, TaskStatus::Expired);
        assert!(record.error.is_some());
        assert!(f.shard.peek_all().await.is_empty());
    }

    #[tokio::test]
    async fn redelivery_count_at_the_limit_expires_without_enqueue() {
        let f = fixture(5, 10);
        let (task_id, _) = running_on_delivery(&f, 5).await;
        f.clock.advance(ChronoDuration::seconds(31));

        let report = f.checker.sweep_once().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.requeued, 0);

        let record = f.store.get(task_id).await.unwrap().unwrap();
        assert_eq!(record.task_status, TaskStatus::Expired);
        assert_eq!(record.retry_count, 0);
        assert!(record.error.unwrap().contains("5 deliveries"));
        assert!(f.shard.peek_all().await.is_empty());
    }

    #[tokio::test]
    async fn redelivery_count_below_the_limit_is_requeued() {
        let f = fixture(5, 10);
        let (task_id, _) = running_on_delivery(&f, 4).await;
        f.clock.advance(ChronoDuration::seconds(31));

        let report = f.checker.sweep_once().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(status(&f, task_id).await, TaskStatus::Pending);
        assert_eq!(f.shard.peek_all().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_outcomes_are_counted_when_metrics_are_enabled() {
        let recorder = CapturingRecorder::default();
        let _guard = metrics::set_default_local_recorder(&recorder);
        let mut f = fixture(2, 10);
        f.checker = f.checker.with_metrics(GridMetrics::new(true));
        running_on_delivery(&f, 1).await;
        running_on_delivery(&f, 2).await;
        f.clock.advance(ChronoDuration::seconds(31));

        f.checker.sweep_once().await.unwrap();
        assert_eq!(recorder.counter("taskgrid_sweep_tasks_total{outcome=requeued}"), 1);
        assert_eq!(recorder.counter("taskgrid_sweep_tasks_total{outcome=expired}"), 1);
        assert_eq!(
            recorder.counter("taskgrid_requests_total{handler=ttl_checker,result=ok}"),
            1
        );
    }

    #[tokio::test]
    async fn sweeping_twice_changes_nothing_more() {
        let f = fixture(3, 10);
        running(&f).await;
        f.clock.advance(ChronoDuration::seconds(31));

        let first = f.checker.sweep_once().await.unwrap();
        let second = f.checker.sweep_once().await.unwrap();
        assert_eq!(first.requeued, 1);
        assert!(second.is_idle());
        assert_eq!(f.shard.peek_all().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sweeps_requeue_each_task_once() {
        let f = Arc::new(fixture(3, 2));
        for _ in 0..5 {
            running(&f).await;
        }
        f.clock.advance(ChronoDuration::seconds(31));

        let (a, b) = tokio::join!(f.checker.sweep_once(), f.checker.sweep_once());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.requeued + b.requeued, 5);
        assert_eq!(f.shard.peek_all().await.len(), 5);
    }

    #[tokio::test]
    async fn pages_are_walked_to_the_end() {
        let f = fixture(3, 2);
        for _ in 0..5 {
            running(&f).await;
        }
        f.clock.advance(ChronoDuration::seconds(31));

        let report = f.checker.sweep_once().await.unwrap();
        assert_eq!(report.scanned, 5);
        assert_eq!(report.requeued, 5);
    }

    #[tokio::test]
    async fn requeue_bound_expires_on_the_next_detection() {
        let f = fixture(2, 10);
        let (task_id, _) = running(&f).await;

        for round in 1..=2 {
            f.clock.advance(ChronoDuration::seconds(31));
            let report = f.checker.sweep_once().await.unwrap();
            assert_eq!(report.requeued, 1, "round {round}");
            claim(&f, task_id, ClaimId::from_ulid(Ulid::new()), 1).await;
        }

        f.clock.advance(ChronoDuration::seconds(31));
        let report = f.checker.sweep_once().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(status(&f, task_id).await, TaskStatus::Expired);
    }

    #[tokio::test]
    async fn requeue_enqueue_failure_fails_the_task() {
        let f = fixture(3, 10);
        let (task_id, _) = running(&f).await;
        f.clock.advance(ChronoDuration::seconds(31));
        f.shard.inject_send_failures(100);

        let report = f.checker.sweep_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(status(&f, task_id).await, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = Arc::new(fixture(3, 10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let f = f.clone();
            async move { f.checker.run(rx).await }
        });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
