//! End-to-end scenarios over the in-memory grid.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use taskgrid_core::app::{
    Grid, GridBuilder, GridConfig, InMemoryBackends, SubmitRequest, TerminalWrite, WorkerAgent,
};
use taskgrid_core::domain::{
    GridError, NewTask, PayloadRef, SessionId, TaskId, TaskStatus, WorkerId,
};
use taskgrid_core::ports::{BlobStore, Clock, DeliveryQueue, FixedClock, TaskMessage, TaskStore};

struct Harness {
    grid: Grid,
    backends: InMemoryBackends,
    clock: Arc<FixedClock>,
}

fn harness(config: GridConfig) -> Harness {
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
    let backends = InMemoryBackends::new(&config, clock.clone());
    let grid = GridBuilder::new(config)
        .with_clock(clock.clone())
        .with_in_memory(&backends)
        .unwrap()
        .build()
        .unwrap();
    Harness {
        grid,
        backends,
        clock,
    }
}

fn request(payload: &[u8]) -> SubmitRequest {
    SubmitRequest {
        task: NewTask {
            priority: 0,
            owner: "alice".to_string(),
            session_id: None,
        },
        payload: payload.to_vec(),
    }
}

impl Harness {
    async fn submit(&self, payload: &[u8]) -> TaskId {
        self.grid.submit.submit(request(payload)).await.unwrap().task_id
    }

    async fn status(&self, task_id: TaskId) -> TaskStatus {
        self.grid.store.get(task_id).await.unwrap().unwrap().task_status
    }

    fn worker(&self, name: &str) -> WorkerAgent {
        self.grid.worker(WorkerId::new(name))
    }

    fn lease_lapses(&self) {
        let lease = Duration::from_std(self.grid.config.heartbeat.lease).unwrap();
        self.clock.advance(lease + Duration::seconds(1));
    }
}

async fn claim_next(worker: &WorkerAgent) -> taskgrid_core::app::worker::Claim {
    let (queue, delivery) = worker.poll().await.unwrap().expect("a visible message");
    worker.claim(queue, delivery).await.unwrap().expect("a claimable task")
}

#[tokio::test]
async fn submit_then_get_returns_pending() {
    let h = harness(GridConfig::default());
    let task_id = h.submit(b"input").await;

    let result = h.grid.results.get_result(task_id).await.unwrap();
    assert_eq!(result.task_status, TaskStatus::Pending);
    assert!(result.result.is_none());
}

#[tokio::test]
async fn stale_worker_is_requeued_and_its_late_write_rejected() {
    let h = harness(GridConfig::default());
    let task_id = h.submit(b"input").await;

    let zombie = h.worker("zombie");
    let lost = claim_next(&zombie).await;
    h.lease_lapses();

    let report = h.grid.ttl_checker.sweep_once().await.unwrap();
    assert_eq!(report.requeued, 1);
    let record = h.grid.store.get(task_id).await.unwrap().unwrap();
    assert_eq!(record.task_status, TaskStatus::Pending);
    assert_eq!(record.retry_count, 1);

    let healthy = h.worker("healthy");
    let claim = claim_next(&healthy).await;
    assert_eq!(claim.task_id(), task_id);

    // 古い claim の書き込みは弾かれる
    let late = zombie.complete(&lost, b"stale".to_vec()).await.unwrap();
    assert_eq!(late, TerminalWrite::Superseded);

    let written = healthy.complete(&claim, b"fresh".to_vec()).await.unwrap();
    assert_eq!(written, TerminalWrite::Written(TaskStatus::Completed));
    let result = h.grid.results.get_result(task_id).await.unwrap();
    assert_eq!(result.result, Some(b"fresh".to_vec()));
}

#[tokio::test]
async fn requeue_bound_expires_the_task() {
    let mut config = GridConfig::default();
    config.queue.max_receive_count = 2;
    let h = harness(config);
    let task_id = h.submit(b"input").await;
    let worker = h.worker("w");

    for _ in 0..2 {
        claim_next(&worker).await;
        h.lease_lapses();
        assert_eq!(h.grid.ttl_checker.sweep_once().await.unwrap().requeued, 1);
    }
    claim_next(&worker).await;
    h.lease_lapses();
    let queued_before = h.backends.shards[0].peek_all().await.len();
    let report = h.grid.ttl_checker.sweep_once().await.unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(h.status(task_id).await, TaskStatus::Expired);
    // EXPIRED は再送されない
    assert_eq!(h.backends.shards[0].peek_all().await.len(), queued_before);
}

#[tokio::test]
async fn last_permitted_delivery_expires_instead_of_requeueing() {
    let mut config = GridConfig::default();
    config.queue.max_receive_count = 1;
    let h = harness(config);
    let task_id = h.submit(b"input").await;
    let claim = claim_next(&h.worker("w")).await;
    assert_eq!(claim.record.receive_count, 1);

    h.lease_lapses();
    let queued_before = h.backends.shards[0].peek_all().await.len();
    let report = h.grid.ttl_checker.sweep_once().await.unwrap();

    assert_eq!(report.requeued, 0);
    assert_eq!(report.expired, 1);
    let record = h.grid.store.get(task_id).await.unwrap().unwrap();
    assert_eq!(record.task_status, TaskStatus::Expired);
    assert_eq!(record.retry_count, 0);
    assert_eq!(h.backends.shards[0].peek_all().await.len(), queued_before);
}

#[tokio::test]
async fn renewed_heartbeat_is_not_swept() {
    let h = harness(GridConfig::default());
    let task_id = h.submit(b"input").await;
    let worker = h.worker("w");
    let claim = claim_next(&worker).await;

    h.clock.advance(Duration::seconds(25));
    worker.renew(&claim).await.unwrap();
    h.clock.advance(Duration::seconds(10));

    let report = h.grid.ttl_checker.sweep_once().await.unwrap();
    assert!(report.is_idle());
    assert_eq!(h.status(task_id).await, TaskStatus::Running);
}

#[tokio::test]
async fn sweeper_is_idempotent() {
    let h = harness(GridConfig::default());
    for _ in 0..3 {
        h.submit(b"input").await;
    }
    let worker = h.worker("w");
    for _ in 0..3 {
        claim_next(&worker).await;
    }
    h.lease_lapses();

    let first = h.grid.ttl_checker.sweep_once().await.unwrap();
    let second = h.grid.ttl_checker.sweep_once().await.unwrap();
    assert_eq!(first.requeued, 3);
    assert!(second.is_idle());
    let counts = h.backends.store.counts_by_status().await;
    assert_eq!(counts.pending, 3);
}

#[tokio::test]
async fn cancel_after_complete_is_a_no_op() {
    let h = harness(GridConfig::default());
    let task_id = h.submit(b"input").await;
    let worker = h.worker("w");
    let claim = claim_next(&worker).await;
    worker.complete(&claim, b"done".to_vec()).await.unwrap();

    let outcome = h.grid.cancel.cancel(task_id, Some("alice")).await.unwrap();
    assert!(!outcome.cancelled);
    assert_eq!(outcome.task_status, TaskStatus::Completed);
    assert_eq!(h.status(task_id).await, TaskStatus::Completed);
}

#[tokio::test]
async fn cancel_and_complete_race_has_one_winner() {
    for _ in 0..20 {
        let h = harness(GridConfig::default());
        let task_id = h.submit(b"input").await;
        let worker = h.worker("w");
        let claim = claim_next(&worker).await;

        let (cancelled, completed) = tokio::join!(
            h.grid.cancel.cancel(task_id, None),
            worker.complete(&claim, b"done".to_vec()),
        );
        let cancelled = cancelled.unwrap();
        let completed = completed.unwrap();

        match h.status(task_id).await {
            TaskStatus::Cancelled => {
                assert!(cancelled.cancelled);
                assert_eq!(completed, TerminalWrite::Superseded);
            }
            TaskStatus::Completed => {
                assert!(!cancelled.cancelled);
                assert_eq!(completed, TerminalWrite::Written(TaskStatus::Completed));
            }
            other => panic!("unexpected final status {other}"),
        }
    }
}

#[tokio::test]
async fn inline_payload_and_result_round_trip() {
    let h = harness(GridConfig::default());
    let task_id = h.submit(b"small input").await;
    let worker = h.worker("w");
    let claim = claim_next(&worker).await;

    let input = worker.load_input(&claim).await.unwrap();
    assert_eq!(input.payload, b"small input".to_vec());
    worker.complete(&claim, b"small output".to_vec()).await.unwrap();

    let record = h.grid.store.get(task_id).await.unwrap().unwrap();
    assert!(!record.payload.is_external());
    assert_eq!(record.result, Some(PayloadRef::Inline(b"small output".to_vec())));
    assert_eq!(h.backends.blobs.len().await, 0);

    let result = h.grid.results.get_result(task_id).await.unwrap();
    assert_eq!(result.result, Some(b"small output".to_vec()));
}

#[tokio::test]
async fn large_payload_is_offloaded_and_read_back() {
    let mut config = GridConfig::default();
    config.payload.inline_limit = 1024;
    let h = harness(config);
    let payload = vec![42u8; 4096];
    let task_id = h.submit(&payload).await;

    let record = h.grid.store.get(task_id).await.unwrap().unwrap();
    let PayloadRef::External(blob) = &record.payload else {
        panic!("payload should be offloaded");
    };
    assert_eq!(h.backends.blobs.get(blob).await.unwrap(), payload);

    let worker = h.worker("w");
    let claim = claim_next(&worker).await;
    assert_eq!(worker.load_input(&claim).await.unwrap().payload, payload);
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let mut config = GridConfig::default();
    config.payload.inline_limit = 8;
    config.payload.max_size = 16;
    let h = harness(config);

    let err = h.grid.submit.submit(request(&[0; 17])).await.unwrap_err();
    assert!(matches!(err, GridError::PayloadTooLarge { size: 17, limit: 16 }));
    assert!(h.backends.store.is_empty().await);
}

#[tokio::test]
async fn enqueue_failure_rolls_the_task_back() {
    let mut config = GridConfig::default();
    config.backend.max_attempts = 2;
    let h = harness(config);
    h.backends.shards[0].inject_send_failures(2);

    let err = h.grid.submit.submit(request(b"input")).await.unwrap_err();
    assert!(err.is_transient());

    let counts = h.backends.store.counts_by_status().await;
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn undeliverable_message_ends_in_dead_letter_queue() {
    let mut config = GridConfig::default();
    config.queue.max_receive_count = 2;
    let h = harness(config);
    let ghost = TaskMessage {
        task_id: TaskId::from(ulid::Ulid::new()),
        task_priority: 0,
    };
    h.backends.shards[0].send(ghost).await.unwrap();
    let worker = h.worker("w");

    for _ in 0..2 {
        let (queue, delivery) = worker.poll().await.unwrap().unwrap();
        assert!(worker.claim(queue, delivery).await.unwrap().is_none());
        h.clock.advance(Duration::seconds(41));
    }

    assert!(worker.poll().await.unwrap().is_none());
    assert_eq!(h.backends.dead_letter.peek_all().await, vec![ghost]);
}

#[tokio::test]
async fn session_progress_tracks_the_batch() {
    let h = harness(GridConfig::default());
    let session = SessionId::new("batch-1");
    let batch = h
        .grid
        .submit
        .submit_batch(session.clone(), vec![request(b"a"), request(b"b"), request(b"c")])
        .await
        .unwrap();
    let worker = h.worker("w");
    let claim = claim_next(&worker).await;
    worker.complete(&claim, Vec::new()).await.unwrap();
    h.grid.cancel.cancel(batch.tasks[2].task_id, None).await.unwrap();

    let results = h
        .grid
        .results
        .get_session_results(&session, None, taskgrid_core::ports::PageRequest::first(10))
        .await
        .unwrap();
    assert_eq!(results.progress.total(), 3);
    assert_eq!(results.progress.finished(), 2);
    assert!(!results.progress.is_finished());
}

#[tokio::test]
async fn clock_drives_heartbeat_deadlines() {
    let h = harness(GridConfig::default());
    h.submit(b"input").await;
    let claim = claim_next(&h.worker("w")).await;

    let expiration = claim.record.heartbeat_expiration_timestamp.unwrap();
    assert_eq!(expiration, h.clock.now() + Duration::seconds(30));
}
