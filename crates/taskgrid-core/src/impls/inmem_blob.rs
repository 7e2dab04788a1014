//! InMemoryBlobStore - 開発用の Blob storage（S3 相当）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{BlobRef, GridError, Result};
use crate::ports::BlobStore;

/// Bucket-scoped object map.
pub struct InMemoryBlobStore {
    bucket: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef> {
        let size = bytes.len();
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(BlobRef {
            key: key.to_string(),
            size,
        })
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(&blob.key)
            .cloned()
            .ok_or_else(|| GridError::BlobNotFound(format!("{}/{}", self.bucket, blob.key)))
    }

    async fn delete(&self, blob: &BlobRef) -> Result<()> {
        self.objects.write().await.remove(&blob.key);
        Ok(())
    }
}
