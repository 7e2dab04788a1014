//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **GridBuilder**: 設定と ports からのワイヤリング
//! - **SubmitService / CancelService / GetResultsService**: 単発のリクエスト処理
//! - **TtlChecker**: heartbeat 期限切れの定期回収
//! - **WorkerAgent / WorkerGroup**: claim → renew → complete のワーカー側プロトコル
//! - **Gateway**: リクエストのルーティングとエラー変換

pub mod builder;
pub mod cancel;
pub mod config;
pub mod gateway;
pub mod results;
pub mod retry;
pub mod submit;
pub mod ttl_checker;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Grid, GridBuilder, InMemoryBackends};
pub use self::cancel::{CancelOutcome, CancelService};
pub use self::config::GridConfig;
pub use self::gateway::{Gateway, GatewayRequest, GatewayResponse, ResponseStatus};
pub use self::results::{GetResultsService, SessionResults, TaskResult};
pub use self::retry::RetryPolicy;
pub use self::submit::{BatchReceipt, SubmitReceipt, SubmitRequest, SubmitService};
pub use self::ttl_checker::{SweepReport, TtlChecker};
pub use self::worker::{
    ExecutionError, TaskExecutor, TaskInput, TerminalWrite, WorkerAgent, WorkerGroup,
};
