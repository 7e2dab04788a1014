//! taskgrid-core
//!
//! Core building blocks for the task grid.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, DeliveryQueue, BlobStore, ResultCache, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, submit, cancel, results, ttl_checker, worker, gateway）
//! - **impls**: in-memory 実装（開発・テスト用）
//! - **observability**: ログ初期化と状態別カウント
//! - **metrics**: `metrics` facade へのカウンタ（`METRICS_ARE_ENABLED` で有効化）

pub mod app;
pub mod domain;
pub mod impls;
pub mod metrics;
pub mod observability;
pub mod ports;
