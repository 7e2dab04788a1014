//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（タスク表, キュー, キャッシュ, Blob storage）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - タスク表が source of truth（正本）。調停は条件付き書き込みのみで行う
//! - キューは `{task_id, priority}` だけを運ぶ
//! - Blob storage は inline に収まらない payload / result の保存先
//! - キャッシュは失っても正しさに影響しない

pub mod artifact_store;
pub mod clock;
pub mod delivery_queue;
pub mod id_generator;
pub mod result_cache;
pub mod task_store;

pub use self::artifact_store::BlobStore;
pub use self::clock::{Clock, FixedClock, SystemClock, to_chrono};
pub use self::delivery_queue::{
    Delivery, DeliveryQueue, PriorityShards, QueueDepth, QueueRouter, ReceiptHandle, TaskMessage,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::result_cache::{CachedResult, ResultCache};
pub use self::task_store::{Page, PageRequest, PageToken, TaskStore};
