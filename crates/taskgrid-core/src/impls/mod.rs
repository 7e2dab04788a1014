//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の in-memory 実装を含めます。
//! 一つのプロセス内でグリッド全体を動かせるので、テストと CLI デモはこれを使います。
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: タスク表 + 2 つのセカンダリインデックス
//! - **InMemoryDeliveryQueue**: visibility timeout / DLQ 付き配送キュー
//! - **InMemoryBlobStore**: 大きな payload / result の保存先
//! - **LruResultCache**: 容量 + TTL 付きの結果キャッシュ

pub mod inmem_blob;
pub mod inmem_delivery;
pub mod inmem_store;
pub mod lru_cache;

pub use self::inmem_blob::InMemoryBlobStore;
pub use self::inmem_delivery::{InMemoryDeliveryQueue, QueueSettings};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::lru_cache::LruResultCache;
