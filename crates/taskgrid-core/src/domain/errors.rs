//! Errors - エラー型と分類
//!
//! # 分類
//! - Transient: ストア/キュー/キャッシュ/blob のタイムアウトやスロットリング（リトライ対象）
//! - Conflict: 条件付き書き込みの競合（リトライしない、再読込して解決）
//! - Permanent: 入力不正・未存在・サイズ超過など（リトライ無意味）

use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskStatus;

/// ErrorKind は運用上の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Conflict,
    Permanent,
}

/// GridError はドメイン全体のエラー
#[derive(Debug, Error)]
pub enum GridError {
    /// 条件付き遷移の期待値が現在の記録と一致しない
    #[error("stale state for {task_id}: expected {expected}, found {actual}")]
    StaleState {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("backend unavailable ({backend}): {message}")]
    TransientBackend {
        backend: &'static str,
        message: String,
    },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("{owner} is not allowed to act on {task_id}")]
    Forbidden { task_id: TaskId, owner: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GridError {
    pub fn transient(backend: &'static str, message: impl Into<String>) -> Self {
        GridError::TransientBackend {
            backend,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::TransientBackend { .. } => ErrorKind::Transient,
            GridError::StaleState { .. } | GridError::AlreadyExists(_) => ErrorKind::Conflict,
            _ => ErrorKind::Permanent,
        }
    }

    /// Stable snake_case name, used as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            GridError::StaleState { .. } => "stale_state",
            GridError::NotFound(_) => "not_found",
            GridError::AlreadyExists(_) => "already_exists",
            GridError::BlobNotFound(_) => "blob_not_found",
            GridError::TransientBackend { .. } => "transient_backend",
            GridError::PayloadTooLarge { .. } => "payload_too_large",
            GridError::Forbidden { .. } => "forbidden",
            GridError::InvalidRequest(_) => "invalid_request",
            GridError::Config(_) => "config",
            GridError::Serialization(_) => "serialization",
        }
    }

    /// Only backend hiccups are retried; a stale-state rejection must never be
    /// replayed as-is.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_stale_state(&self) -> bool {
        matches!(self, GridError::StaleState { .. })
    }
}

pub type Result<T, E = GridError> = std::result::Result<T, E>;
