//! BlobStore port - 大きな payload / result の保存先（S3 相当）
//!
//! inline 閾値を超えた本体だけがここに置かれ、タスク表には `BlobRef` のみ残ります。

use async_trait::async_trait;

use crate::domain::{BlobRef, Result, TaskId};

/// BlobStore は不透明なバイト列を参照文字列で保存・取得する
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef>;

    /// `BlobNotFound` when the key is unknown.
    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>>;

    /// Deleting a missing key is a no-op.
    async fn delete(&self, blob: &BlobRef) -> Result<()>;
}

/// Key layout inside the bucket.
pub fn payload_key(task_id: TaskId) -> String {
    format!("{task_id}/payload")
}

pub fn result_key(task_id: TaskId) -> String {
    format!("{task_id}/result")
}
