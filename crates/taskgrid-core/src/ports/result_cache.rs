//! ResultCache port - 結果読み出しの best-effort キャッシュ（Redis 相当）
//!
//! 耐久性の保証はありません。ミスはタスク表へのフォールバックで解決します。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Result, TaskId, TaskStatus};

/// A fully dereferenced terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, task_id: TaskId) -> Result<Option<CachedResult>>;

    async fn put(&self, entry: CachedResult) -> Result<()>;

    async fn invalidate(&self, task_id: TaskId) -> Result<()>;
}
