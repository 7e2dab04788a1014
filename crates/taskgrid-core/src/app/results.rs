//! GetResultsService - 結果の読み出し（状態は一切変更しない）
//!
//! 読み出し順: キャッシュ → タスク表 → Blob storage。
//! 終端状態の結果だけをキャッシュに入れる。キャッシュの失敗は読み出しを妨げない。

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::app::retry::RetryPolicy;
use crate::domain::{
    GridError, PayloadRef, Result, SessionId, SessionIndexEntry, TaskId, TaskRecord, TaskStatus,
};
use crate::metrics::GridMetrics;
use crate::observability::{StatusCounts, task_span};
use crate::ports::{BlobStore, CachedResult, PageRequest, PageToken, ResultCache, TaskStore};

/// Status, plus result / error once the task is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn is_terminal(&self) -> bool {
        self.task_status.is_terminal()
    }
}

impl From<CachedResult> for TaskResult {
    fn from(cached: CachedResult) -> Self {
        Self {
            task_id: cached.task_id,
            task_status: cached.task_status,
            result: cached.result,
            error: cached.error,
        }
    }
}

impl From<TaskResult> for CachedResult {
    fn from(result: TaskResult) -> Self {
        Self {
            task_id: result.task_id,
            task_status: result.task_status,
            result: result.result,
            error: result.error,
        }
    }
}

/// One page of a session's tasks with progress over the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResults {
    pub session_id: SessionId,
    pub tasks: Vec<SessionIndexEntry>,
    pub progress: StatusCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<PageToken>,
}

pub struct GetResultsService {
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<dyn ResultCache>,
    retry: RetryPolicy,
    cache_retry: RetryPolicy,
    page_size: usize,
    metrics: GridMetrics,
}

impl GetResultsService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<dyn ResultCache>,
        retry: RetryPolicy,
        page_size: usize,
    ) -> Self {
        // best-effort: one attempt, same timeout
        let cache_retry = RetryPolicy::once(retry.timeout);
        Self {
            store,
            blobs,
            cache,
            retry,
            cache_retry,
            page_size: page_size.max(1),
            metrics: GridMetrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: GridMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn get_result(&self, task_id: TaskId) -> Result<TaskResult> {
        let started = Instant::now();
        let result = self
            .get_result_inner(task_id)
            .instrument(task_span("get_result", task_id))
            .await;
        self.metrics.record_request("get_result", &result, started.elapsed());
        result
    }

    async fn get_result_inner(&self, task_id: TaskId) -> Result<TaskResult> {
        match self
            .cache_retry
            .call("cache", "get", || self.cache.get(task_id))
            .await
        {
            Ok(Some(hit)) => {
                self.metrics.record_cache_lookup(true);
                tracing::debug!("result cache hit");
                return Ok(hit.into());
            }
            Ok(None) => self.metrics.record_cache_lookup(false),
            Err(e) => tracing::warn!(error = %e, "result cache unavailable, reading the store"),
        }

        let record = self
            .retry
            .call("store", "get", || self.store.get(task_id))
            .await?
            .ok_or(GridError::NotFound(task_id))?;

        if !record.task_status.is_terminal() {
            return Ok(TaskResult {
                task_id,
                task_status: record.task_status,
                result: None,
                error: None,
            });
        }

        let result = self.dereference(&record).await?;
        if let Err(e) = self
            .cache_retry
            .call("cache", "put", || self.cache.put(result.clone().into()))
            .await
        {
            tracing::warn!(error = %e, "failed to populate result cache");
        }
        Ok(result)
    }

    async fn dereference(&self, record: &TaskRecord) -> Result<TaskResult> {
        let result = match &record.result {
            None => None,
            Some(PayloadRef::Inline(bytes)) => Some(bytes.clone()),
            Some(PayloadRef::External(blob)) => Some(
                self.retry
                    .call("blob", "get", || self.blobs.get(blob))
                    .await?,
            ),
        };
        Ok(TaskResult {
            task_id: record.task_id,
            task_status: record.task_status,
            result,
            error: record.error.clone(),
        })
    }

    /// Tasks of a session (optionally one status), paginated, plus progress
    /// counts across every status of the session.
    pub async fn get_session_results(
        &self,
        session_id: &SessionId,
        status: Option<TaskStatus>,
        page: PageRequest,
    ) -> Result<SessionResults> {
        let started = Instant::now();
        let results = self.session_results(session_id, status, page).await;
        self.metrics
            .record_request("get_session_results", &results, started.elapsed());
        results
    }

    async fn session_results(
        &self,
        session_id: &SessionId,
        status: Option<TaskStatus>,
        page: PageRequest,
    ) -> Result<SessionResults> {
        let listed = self
            .retry
            .call("store", "query_by_session", || {
                self.store.query_by_session(session_id, status, page.clone())
            })
            .await?;

        let mut progress = StatusCounts::default();
        let mut cursor = PageRequest::first(self.page_size);
        loop {
            let scanned = self
                .retry
                .call("store", "query_by_session", || {
                    self.store.query_by_session(session_id, None, cursor.clone())
                })
                .await?;
            for entry in &scanned.items {
                progress.record(entry.task_status);
            }
            match scanned.next {
                Some(token) => cursor = PageRequest::next(self.page_size, token),
                None => break,
            }
        }

        tracing::debug!(
            session_id = %session_id,
            total = progress.total(),
            finished = progress.finished(),
            "session results read"
        );
        Ok(SessionResults {
            session_id: session_id.clone(),
            tasks: listed.items,
            progress,
            next: listed.next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimId, NewTask, TaskUpdate, WorkerId};
    use crate::impls::{InMemoryBlobStore, InMemoryTaskStore, LruResultCache};
    use crate::metrics::testing::CapturingRecorder;
    use crate::ports::{Clock, FixedClock};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use ulid::Ulid;

    struct Fixture {
        service: GetResultsService,
        store: Arc<InMemoryTaskStore>,
        blobs: Arc<InMemoryBlobStore>,
        cache: Arc<LruResultCache>,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let blobs = Arc::new(InMemoryBlobStore::new("bucket"));
        let cache = Arc::new(LruResultCache::new(16, Duration::from_secs(60), clock.clone()));
        let service = GetResultsService::new(
            store.clone(),
            blobs.clone(),
            cache.clone(),
            RetryPolicy::default(),
            2,
        );
        Fixture {
            service,
            store,
            blobs,
            cache,
            clock,
        }
    }

    async fn seed(f: &Fixture, session: Option<&str>) -> TaskId {
        let task_id = TaskId::from_ulid(Ulid::new());
        let task = NewTask {
            priority: 0,
            owner: "alice".to_string(),
            session_id: session.map(SessionId::new),
        };
        let record =
            TaskRecord::new_pending(task, PayloadRef::Inline(vec![]), task_id, f.clock.now());
        f.store.put_if_absent(record).await.unwrap();
        task_id
    }

    async fn complete(f: &Fixture, task_id: TaskId, result: PayloadRef) {
        let claim = TaskUpdate::claim(
            ClaimId::from_ulid(Ulid::new()),
            WorkerId::new("w-1"),
            f.clock.now() + chrono::Duration::seconds(30),
            1,
        );
        f.store
            .compare_and_swap_status(task_id, TaskStatus::Pending, TaskStatus::Running, claim)
            .await
            .unwrap();
        f.store
            .compare_and_swap_status(
                task_id,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskUpdate::none().with_result(result),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pending_task_reports_status_only() {
        let f = fixture();
        let task_id = seed(&f, None).await;

        let result = f.service.get_result(task_id).await.unwrap();
        assert_eq!(result.task_status, TaskStatus::Pending);
        assert!(result.result.is_none());
        // 非終端は cache しない
        assert_eq!(f.cache.len().await, 0);
    }

    #[tokio::test]
    async fn inline_result_is_returned_and_cached() {
        let f = fixture();
        let task_id = seed(&f, None).await;
        complete(&f, task_id, PayloadRef::Inline(b"42".to_vec())).await;

        let result = f.service.get_result(task_id).await.unwrap();
        assert_eq!(result.result.as_deref(), Some(&b"42"[..]));
        assert_eq!(
            f.cache.get(task_id).await.unwrap().map(TaskResult::from),
            Some(result)
        );
    }

    #[tokio::test]
    async fn external_result_is_dereferenced() {
        let f = fixture();
        let task_id = seed(&f, None).await;
        let blob = f.blobs.put("r", vec![9; 100]).await.unwrap();
        complete(&f, task_id, PayloadRef::External(blob)).await;

        let result = f.service.get_result(task_id).await.unwrap();
        assert_eq!(result.result, Some(vec![9; 100]));
    }

    #[tokio::test]
    async fn missing_blob_surfaces_as_error() {
        let f = fixture();
        let task_id = seed(&f, None).await;
        let blob = crate::domain::BlobRef {
            key: "gone".to_string(),
            size: 3,
        };
        complete(&f, task_id, PayloadRef::External(blob)).await;

        let err = f.service.get_result(task_id).await.unwrap_err();
        assert!(matches!(err, GridError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let f = fixture();
        let err = f
            .service
            .get_result(TaskId::from_ulid(Ulid::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::NotFound(_)));
    }

    #[tokio::test]
    async fn session_results_count_every_page() {
        let f = fixture();
        let a = seed(&f, Some("s-1")).await;
        seed(&f, Some("s-1")).await;
        seed(&f, Some("s-1")).await;
        seed(&f, Some("other")).await;
        complete(&f, a, PayloadRef::Inline(vec![])).await;

        let session = SessionId::new("s-1");
        let page = f
            .service
            .get_session_results(&session, None, PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(page.tasks.len(), 3);
        assert_eq!(page.progress.total(), 3);
        assert_eq!(page.progress.completed, 1);
        assert_eq!(page.progress.pending, 2);

        let completed = f
            .service
            .get_session_results(&session, Some(TaskStatus::Completed), PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(completed.tasks.len(), 1);
        assert_eq!(completed.tasks[0].task_id, a);
        assert_eq!(completed.progress.total(), 3);
    }

    #[tokio::test]
    async fn cache_hits_and_misses_are_counted() {
        let recorder = CapturingRecorder::default();
        let _guard = metrics::set_default_local_recorder(&recorder);
        let mut f = fixture();
        f.service = f.service.with_metrics(GridMetrics::new(true));
        let task_id = seed(&f, None).await;
        complete(&f, task_id, PayloadRef::Inline(b"42".to_vec())).await;

        f.service.get_result(task_id).await.unwrap();
        f.service.get_result(task_id).await.unwrap();
        f.service
            .get_result(TaskId::from_ulid(Ulid::new()))
            .await
            .unwrap_err();

        assert_eq!(recorder.counter("taskgrid_result_cache_lookups_total{result=hit}"), 1);
        assert_eq!(recorder.counter("taskgrid_result_cache_lookups_total{result=miss}"), 2);
        assert_eq!(
            recorder.counter("taskgrid_requests_total{handler=get_result,result=ok}"),
            2
        );
        assert_eq!(
            recorder.counter("taskgrid_requests_total{handler=get_result,result=not_found}"),
            1
        );
    }
}
