//! GridBuilder - ports と設定からサービス群を組み立てる
//!
//! # Fail-fast 設計
//! - build() 時に設定を検証し、不正なら BuildError を返す
//! - ルーターのシャード数が `TASK_QUEUE_PRIORITIES` と一致するかチェック
//! - 指定されなかった ports は in-memory 実装で埋める

use std::sync::Arc;
use std::time::Duration;

use crate::app::cancel::CancelService;
use crate::app::config::GridConfig;
use crate::app::gateway::Gateway;
use crate::app::results::GetResultsService;
use crate::app::retry::RetryPolicy;
use crate::app::submit::SubmitService;
use crate::app::ttl_checker::TtlChecker;
use crate::app::worker::{TaskExecutor, WorkerAgent, WorkerGroup};
use crate::domain::{GridError, WorkerId};
use crate::impls::{
    InMemoryBlobStore, InMemoryDeliveryQueue, InMemoryTaskStore, LruResultCache, QueueSettings,
};
use crate::metrics::GridMetrics;
use crate::ports::delivery_queue::shard_name;
use crate::ports::{
    BlobStore, Clock, DeliveryQueue, IdGenerator, PriorityShards, QueueRouter, ResultCache,
    SystemClock, TaskStore, UlidGenerator,
};

/// BuildError はグリッド構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[source] GridError),

    #[error("router has {actual} shards but {expected} priority classes are configured")]
    ShardCountMismatch { expected: u32, actual: usize },
}

/// In-memory backends with their concrete types kept, so callers can inspect
/// queues or inject faults.
#[derive(Clone)]
pub struct InMemoryBackends {
    pub store: Arc<InMemoryTaskStore>,
    pub shards: Vec<Arc<InMemoryDeliveryQueue>>,
    pub dead_letter: Arc<InMemoryDeliveryQueue>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub cache: Arc<LruResultCache>,
}

impl InMemoryBackends {
    pub fn new(config: &GridConfig, clock: Arc<dyn Clock>) -> Self {
        let dead_letter = Arc::new(InMemoryDeliveryQueue::new(
            config.queue.dead_letter_name.clone(),
            QueueSettings {
                visibility_timeout: config.queue.visibility_timeout,
                retention: config.queue.retention,
                max_receive_count: None,
            },
            clock.clone(),
        ));
        let shards = (0..config.queue.priorities)
            .map(|priority| {
                let queue = InMemoryDeliveryQueue::new(
                    shard_name(&config.queue.name, priority),
                    QueueSettings {
                        visibility_timeout: config.queue.visibility_timeout,
                        retention: config.queue.retention,
                        max_receive_count: Some(config.queue.max_receive_count),
                    },
                    clock.clone(),
                )
                .with_dead_letter(dead_letter.clone());
                Arc::new(queue)
            })
            .collect();
        Self {
            store: Arc::new(InMemoryTaskStore::new(clock.clone())),
            shards,
            dead_letter,
            blobs: Arc::new(InMemoryBlobStore::new(config.payload.bucket.clone())),
            cache: Arc::new(LruResultCache::new(
                config.cache.capacity,
                config.cache.ttl,
                clock,
            )),
        }
    }

    pub fn router(&self) -> Result<PriorityShards, GridError> {
        PriorityShards::new(
            self.shards
                .iter()
                .map(|shard| shard.clone() as Arc<dyn DeliveryQueue>)
                .collect(),
            self.dead_letter.clone(),
        )
    }
}

/// GridBuilder はグリッドを構築
///
/// # 使用例
/// ```ignore
/// let grid = GridBuilder::new(GridConfig::from_env()?)
///     .with_clock(clock)
///     .build()?;
/// let receipt = grid.submit.submit(request).await?;
/// ```
pub struct GridBuilder {
    config: GridConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    store: Option<Arc<dyn TaskStore>>,
    router: Option<(Arc<dyn QueueRouter>, usize)>,
    blobs: Option<Arc<dyn BlobStore>>,
    cache: Option<Arc<dyn ResultCache>>,
}

impl GridBuilder {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            clock: None,
            ids: None,
            store: None,
            router: None,
            blobs: None,
            cache: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_router(mut self, router: PriorityShards) -> Self {
        let shards = router.len();
        self.router = Some((Arc::new(router), shards));
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use every port of `backends`.
    pub fn with_in_memory(self, backends: &InMemoryBackends) -> Result<Self, BuildError> {
        let router = backends.router().map_err(BuildError::InvalidConfig)?;
        Ok(self
            .with_store(backends.store.clone())
            .with_router(router)
            .with_blob_store(backends.blobs.clone())
            .with_cache(backends.cache.clone()))
    }

    /// Validate and wire. Ports left unset get in-memory implementations.
    pub fn build(self) -> Result<Grid, BuildError> {
        self.config.validate().map_err(BuildError::InvalidConfig)?;
        let config = self.config;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        let mut defaults = None;
        let mut in_memory = || {
            defaults
                .get_or_insert_with(|| InMemoryBackends::new(&config, clock.clone()))
                .clone()
        };

        let store = match self.store {
            Some(store) => store,
            None => in_memory().store,
        };
        let (router, shards) = match self.router {
            Some(router) => router,
            None => {
                let backends = in_memory();
                let router = backends.router().map_err(BuildError::InvalidConfig)?;
                let shards = router.len();
                (Arc::new(router) as Arc<dyn QueueRouter>, shards)
            }
        };
        if shards != config.queue.priorities as usize {
            return Err(BuildError::ShardCountMismatch {
                expected: config.queue.priorities,
                actual: shards,
            });
        }
        let blobs = match self.blobs {
            Some(blobs) => blobs,
            None => in_memory().blobs,
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None => in_memory().cache,
        };

        let retry = RetryPolicy::from_settings(&config.backend);
        let metrics = GridMetrics::new(config.metrics_enabled);
        let submit = Arc::new(
            SubmitService::new(
                store.clone(),
                router.clone(),
                blobs.clone(),
                ids.clone(),
                clock.clone(),
                config.payload.clone(),
                retry.clone(),
            )
            .with_metrics(metrics),
        );
        let cancel = Arc::new(
            CancelService::new(store.clone(), cache.clone(), retry.clone()).with_metrics(metrics),
        );
        let results = Arc::new(
            GetResultsService::new(
                store.clone(),
                blobs.clone(),
                cache.clone(),
                retry.clone(),
                config.sweeper.page_size,
            )
            .with_metrics(metrics),
        );
        let ttl_checker = Arc::new(
            TtlChecker::new(
                store.clone(),
                router.clone(),
                clock.clone(),
                config.sweeper.clone(),
                config.queue.max_receive_count,
                retry.clone(),
            )
            .with_metrics(metrics),
        );

        tracing::info!(
            table = %config.table.name,
            queue = %config.queue.name,
            priorities = config.queue.priorities,
            bucket = %config.payload.bucket,
            metrics = metrics.is_enabled(),
            "grid built"
        );
        Ok(Grid {
            config,
            store,
            router,
            blobs,
            cache,
            clock,
            ids,
            retry,
            submit,
            cancel,
            results,
            ttl_checker,
        })
    }
}

/// Grid はサービス群と共有 ports のまとまり
pub struct Grid {
    pub config: GridConfig,
    pub store: Arc<dyn TaskStore>,
    pub router: Arc<dyn QueueRouter>,
    pub blobs: Arc<dyn BlobStore>,
    pub cache: Arc<dyn ResultCache>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub retry: RetryPolicy,
    pub submit: Arc<SubmitService>,
    pub cancel: Arc<CancelService>,
    pub results: Arc<GetResultsService>,
    pub ttl_checker: Arc<TtlChecker>,
}

impl Grid {
    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.submit.clone(), self.cancel.clone(), self.results.clone())
    }

    pub fn worker(&self, worker_id: WorkerId) -> WorkerAgent {
        WorkerAgent::new(
            worker_id,
            self.store.clone(),
            self.router.clone(),
            self.blobs.clone(),
            self.ids.clone(),
            self.clock.clone(),
            &self.config,
            self.retry.clone(),
        )
    }

    /// Spawn `n` workers named `{prefix}-{i}`.
    pub fn spawn_workers(
        &self,
        prefix: &str,
        n: usize,
        executor: Arc<dyn TaskExecutor>,
        idle_wait: Duration,
    ) -> WorkerGroup {
        let agents = (0..n)
            .map(|i| {
                self.worker(WorkerId::new(format!("{prefix}-{i}")))
                    .with_idle_wait(idle_wait)
            })
            .collect();
        WorkerGroup::spawn(agents, executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_defaults() {
        let grid = GridBuilder::new(GridConfig::default()).build();
        assert!(grid.is_ok());
    }

    #[test]
    fn test_build_invalid_config() {
        let mut config = GridConfig::default();
        config.sweeper.page_size = 0;

        let grid = GridBuilder::new(config).build();
        assert!(matches!(grid, Err(BuildError::InvalidConfig(GridError::Config(_)))));
    }

    #[test]
    fn test_build_shard_count_mismatch() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backends = InMemoryBackends::new(&GridConfig::default(), clock);

        let mut config = GridConfig::default();
        config.queue.priorities = 3;
        let grid = GridBuilder::new(config)
            .with_in_memory(&backends)
            .unwrap()
            .build();
        assert!(matches!(
            grid,
            Err(BuildError::ShardCountMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn in_memory_shards_follow_naming() {
        let mut config = GridConfig::default();
        config.queue.priorities = 2;
        let backends = InMemoryBackends::new(&config, Arc::new(SystemClock));

        let names: Vec<&str> = backends.shards.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["task_queue__0", "task_queue__1"]);
        assert_eq!(backends.dead_letter.name(), "task_queue_dlq");
    }

    #[tokio::test]
    async fn metrics_flag_reaches_the_services() {
        use crate::app::submit::SubmitRequest;
        use crate::domain::{NewTask, TaskId};
        use crate::metrics::testing::CapturingRecorder;

        let recorder = CapturingRecorder::default();
        let _guard = metrics::set_default_local_recorder(&recorder);
        let mut config = GridConfig::default();
        config.metrics_enabled = true;
        let grid = GridBuilder::new(config).build().unwrap();

        let request = SubmitRequest {
            task: NewTask {
                priority: 0,
                owner: "alice".to_string(),
                session_id: None,
            },
            payload: b"{}".to_vec(),
        };
        let task_id = grid.submit.submit(request).await.unwrap().task_id;
        grid.cancel.cancel(task_id, None).await.unwrap();
        grid.results.get_result(task_id).await.unwrap();
        grid.results
            .get_result(TaskId::from_ulid(ulid::Ulid::new()))
            .await
            .unwrap_err();

        assert_eq!(recorder.counter("taskgrid_requests_total{handler=submit,result=ok}"), 1);
        assert_eq!(recorder.counter("taskgrid_cancels_total{outcome=cancelled}"), 1);
        assert_eq!(
            recorder.counter("taskgrid_requests_total{handler=get_result,result=not_found}"),
            1
        );
    }
}
