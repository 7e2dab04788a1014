//! GridConfig - 起動時に一度だけ作る不変の設定
//!
//! 環境変数から読み込めますが、読み出しは注入された lookup 関数経由なので
//! テストはプロセスの環境に触れません。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{GridError, Result};

/// Task table naming and capacity hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSettings {
    pub name: String,
    pub read_capacity: u64,
    pub write_capacity: u64,
}

/// Priority shard set and delivery semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Shards are named `<name>__<priority>`.
    pub name: String,
    pub dead_letter_name: String,
    pub priorities: u32,
    pub visibility_timeout: Duration,
    pub retention: Duration,
    pub max_receive_count: u32,
}

/// Inline-vs-blob decision for payloads and results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadPolicy {
    pub always_external: bool,
    pub inline_limit: usize,
    pub max_size: usize,
    pub bucket: String,
}

impl PayloadPolicy {
    /// `PayloadTooLarge` above the hard limit, otherwise whether the body
    /// goes to the blob store.
    pub fn should_offload(&self, size: usize) -> Result<bool> {
        if size > self.max_size {
            return Err(GridError::PayloadTooLarge {
                size,
                limit: self.max_size,
            });
        }
        Ok(self.always_external || size > self.inline_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperSettings {
    pub interval: Duration,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    pub lease: Duration,
    pub interval: Duration,
}

/// Bounds applied to every store / queue / blob / cache call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    pub table: TableSettings,
    pub queue: QueueConfig,
    pub payload: PayloadPolicy,
    pub cache: CacheSettings,
    pub sweeper: SweeperSettings,
    pub heartbeat: HeartbeatSettings,
    pub backend: BackendSettings,
    /// Emit counters and histograms through the `metrics` facade.
    pub metrics_enabled: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            table: TableSettings {
                name: "tasks_state_table".to_string(),
                read_capacity: 10,
                write_capacity: 10,
            },
            queue: QueueConfig {
                name: "task_queue".to_string(),
                dead_letter_name: "task_queue_dlq".to_string(),
                priorities: 1,
                visibility_timeout: Duration::from_secs(40),
                retention: Duration::from_secs(1_209_600),
                max_receive_count: 5,
            },
            payload: PayloadPolicy {
                always_external: false,
                inline_limit: 64 * 1024,
                max_size: 100 * 1024 * 1024,
                bucket: "taskgrid-payloads".to_string(),
            },
            cache: CacheSettings {
                capacity: 1024,
                ttl: Duration::from_secs(300),
            },
            sweeper: SweeperSettings {
                interval: Duration::from_secs(60),
                page_size: 100,
            },
            heartbeat: HeartbeatSettings {
                lease: Duration::from_secs(30),
                interval: Duration::from_secs(10),
            },
            backend: BackendSettings {
                timeout: Duration::from_millis(5000),
                max_attempts: 4,
            },
            metrics_enabled: false,
        }
    }
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl GridConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source; unset or blank variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env: Lookup<'_> = &lookup;
        let mut config = Self::default();

        if let Some(v) = env_string(env, "STATE_TABLE_NAME") {
            config.table.name = v;
        }
        if let Some(v) = env_u64(env, "DDB_DEFAULT_READ")? {
            config.table.read_capacity = v;
        }
        if let Some(v) = env_u64(env, "DDB_DEFAULT_WRITE")? {
            config.table.write_capacity = v;
        }

        if let Some(v) = env_string(env, "TASKS_QUEUE_NAME") {
            config.queue.name = v;
        }
        if let Some(v) = env_string(env, "TASKS_QUEUE_DLQ_NAME") {
            config.queue.dead_letter_name = v;
        }
        if let Some(v) = env_u32(env, "TASK_QUEUE_PRIORITIES")? {
            config.queue.priorities = v;
        }
        if let Some(v) = env_secs(env, "QUEUE_VISIBILITY_TIMEOUT_SECS")? {
            config.queue.visibility_timeout = v;
        }
        if let Some(v) = env_secs(env, "QUEUE_RETENTION_SECS")? {
            config.queue.retention = v;
        }
        if let Some(v) = env_u32(env, "QUEUE_MAX_RECEIVE_COUNT")? {
            config.queue.max_receive_count = v;
        }

        if let Some(v) = env_bool(env, "TASK_INPUT_PASSED_VIA_EXTERNAL_STORAGE")? {
            config.payload.always_external = v;
        }
        if let Some(v) = env_usize(env, "INLINE_PAYLOAD_LIMIT_BYTES")? {
            config.payload.inline_limit = v;
        }
        if let Some(v) = env_usize(env, "MAX_PAYLOAD_BYTES")? {
            config.payload.max_size = v;
        }
        if let Some(v) = env_string(env, "S3_BUCKET") {
            config.payload.bucket = v;
        }

        if let Some(v) = env_usize(env, "RESULT_CACHE_CAPACITY")? {
            config.cache.capacity = v;
        }
        if let Some(v) = env_secs(env, "RESULT_CACHE_TTL_SECS")? {
            config.cache.ttl = v;
        }

        if let Some(v) = env_secs(env, "TTL_CHECKER_INTERVAL_SECS")? {
            config.sweeper.interval = v;
        }
        if let Some(v) = env_usize(env, "TTL_CHECKER_PAGE_SIZE")? {
            config.sweeper.page_size = v;
        }

        if let Some(v) = env_secs(env, "HEARTBEAT_LEASE_SECS")? {
            config.heartbeat.lease = v;
        }
        if let Some(v) = env_secs(env, "HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat.interval = v;
        }

        if let Some(v) = env_u64(env, "BACKEND_TIMEOUT_MS")? {
            config.backend.timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u32(env, "BACKEND_MAX_ATTEMPTS")? {
            config.backend.max_attempts = v;
        }

        if let Some(v) = env_bool(env, "METRICS_ARE_ENABLED")? {
            config.metrics_enabled = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.priorities == 0 {
            return Err(GridError::Config(
                "TASK_QUEUE_PRIORITIES must be at least 1".to_string(),
            ));
        }
        if self.queue.max_receive_count == 0 {
            return Err(GridError::Config(
                "QUEUE_MAX_RECEIVE_COUNT must be at least 1".to_string(),
            ));
        }
        if self.queue.visibility_timeout.is_zero() {
            return Err(GridError::Config(
                "QUEUE_VISIBILITY_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        if self.payload.inline_limit > self.payload.max_size {
            return Err(GridError::Config(format!(
                "INLINE_PAYLOAD_LIMIT_BYTES ({}) exceeds MAX_PAYLOAD_BYTES ({})",
                self.payload.inline_limit, self.payload.max_size
            )));
        }
        if self.sweeper.page_size == 0 {
            return Err(GridError::Config(
                "TTL_CHECKER_PAGE_SIZE must be at least 1".to_string(),
            ));
        }
        if self.sweeper.interval.is_zero() {
            return Err(GridError::Config(
                "TTL_CHECKER_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.interval >= self.heartbeat.lease {
            return Err(GridError::Config(format!(
                "HEARTBEAT_INTERVAL_SECS ({:?}) must be positive \
                 and shorter than HEARTBEAT_LEASE_SECS ({:?})",
                self.heartbeat.interval, self.heartbeat.lease
            )));
        }
        if self.backend.max_attempts == 0 {
            return Err(GridError::Config(
                "BACKEND_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(env: Lookup<'_>, name: &str) -> Option<String> {
    env(name).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(env: Lookup<'_>, name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(env, name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| GridError::Config(format!("{name} must be a u64: {e}")))
}

fn env_u32(env: Lookup<'_>, name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(env, name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| GridError::Config(format!("{name} must be a u32: {e}")))
}

fn env_usize(env: Lookup<'_>, name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(env, name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| GridError::Config(format!("{name} must be a usize: {e}")))
}

fn env_secs(env: Lookup<'_>, name: &str) -> Result<Option<Duration>> {
    Ok(env_u64(env, name)?.map(Duration::from_secs))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(GridError::Config(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(env: Lookup<'_>, name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(env, name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}
