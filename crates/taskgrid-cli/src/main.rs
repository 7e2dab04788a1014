use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::sleep;

use taskgrid_core::app::{
    ExecutionError, Gateway, GatewayResponse, GridBuilder, GridConfig, ResponseStatus,
    TaskExecutor, TaskInput,
};
use taskgrid_core::metrics::register_metrics;
use taskgrid_core::observability::{LogFormat, StatusCounts, init_logging};

/// Run an in-memory task grid end to end: submit a batch, execute it on a
/// worker group, sweep stale tasks, and print the results.
#[derive(Debug, Clone, Parser)]
#[command(name = "taskgrid", version, about, long_about = None)]
struct CliArgs {
    /// Number of worker loops.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Number of tasks in the demo batch.
    #[arg(long, default_value_t = 10)]
    tasks: usize,

    /// Every n-th task fails on purpose (0 = never).
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Number of priority shards; overrides TASK_QUEUE_PRIORITIES.
    #[arg(long)]
    priorities: Option<u32>,

    /// Give up waiting for the batch after this many seconds.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log output format. Levels come from TASKGRID_LOG.
    #[arg(long, value_enum, default_value_t = CliLogFormat::Pretty)]
    log_format: CliLogFormat,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
    #[serde(default)]
    fail: bool,
}

/// Greets `name`, or fails when asked to.
struct HelloExecutor;

#[async_trait]
impl TaskExecutor for HelloExecutor {
    async fn execute(&self, input: &TaskInput) -> Result<Vec<u8>, ExecutionError> {
        let payload: HelloPayload = serde_json::from_slice(&input.payload)
            .map_err(|e| ExecutionError::new(format!("json decode: {e}")))?;
        if payload.fail {
            return Err(ExecutionError::new(format!(
                "intentional failure for {}",
                payload.name
            )));
        }
        sleep(Duration::from_millis(20)).await;
        serde_json::to_vec(&serde_json::json!({ "greeting": format!("Hello, {}!", payload.name) }))
            .map_err(|e| ExecutionError::new(e.to_string()))
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("taskgrid error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_format.into());

    let mut config = GridConfig::from_env().context("loading configuration")?;
    if let Some(priorities) = args.priorities {
        config.queue.priorities = priorities;
    }
    let priorities = config.queue.priorities;
    if config.metrics_enabled {
        // recorder は埋め込み側が入れる。ここでは説明だけ登録する
        register_metrics();
    }
    let grid = GridBuilder::new(config).build().context("building grid")?;
    let gateway = grid.gateway();

    let workers = grid.spawn_workers(
        "worker",
        args.workers,
        Arc::new(HelloExecutor),
        Duration::from_millis(20),
    );
    let (sweeper_tx, sweeper_rx) = watch::channel(false);
    let sweeper = tokio::spawn({
        let checker = grid.ttl_checker.clone();
        async move { checker.run(sweeper_rx).await }
    });

    let session_id = format!("demo-{}", std::process::id());
    let tasks: Vec<_> = (0..args.tasks)
        .map(|i| {
            serde_json::json!({
                "priority": i as u32 % priorities.max(1),
                "payload": {
                    "name": format!("task-{i}"),
                    "fail": args.fail_every > 0 && (i + 1) % args.fail_every == 0,
                },
            })
        })
        .collect();
    let submitted = call(
        &gateway,
        serde_json::json!({
            "action": "submit_batch",
            "owner": "cli",
            "session_id": session_id,
            "tasks": tasks,
        }),
    )
    .await?;
    let task_ids: Vec<String> = submitted.body["tasks"]
        .as_array()
        .map(|tasks| {
            tasks
                .iter()
                .filter_map(|t| t["task_id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    println!("submitted {} tasks in session {session_id}", task_ids.len());

    let progress = tokio::select! {
        progress = wait_for_session(&gateway, &session_id) => progress?,
        _ = sleep(Duration::from_secs(args.timeout_secs)) => {
            bail!("session {session_id} did not finish within {}s", args.timeout_secs)
        }
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };

    for task_id in &task_ids {
        let result = call(
            &gateway,
            serde_json::json!({ "action": "get_result", "task_id": task_id }),
        )
        .await?;
        println!(
            "{task_id}: {} result={} error={}",
            result.body["task_status"], result.body["result"], result.body["error"]
        );
    }
    println!("progress: {progress:?}");

    workers.shutdown_and_join().await;
    let _ = sweeper_tx.send(true);
    sweeper.await.context("joining sweeper")?;
    Ok(())
}

/// Send one JSON request through the gateway; non-ok statuses are errors.
async fn call(gateway: &Gateway, request: serde_json::Value) -> anyhow::Result<GatewayResponse> {
    let raw = gateway.handle_json(&request.to_string()).await;
    let response: GatewayResponse = serde_json::from_str(&raw).context("decoding response")?;
    if response.status != ResponseStatus::Ok {
        bail!("{:?}: {}", response.status, response.body);
    }
    Ok(response)
}

async fn wait_for_session(gateway: &Gateway, session_id: &str) -> anyhow::Result<StatusCounts> {
    loop {
        let response = call(
            gateway,
            serde_json::json!({
                "action": "get_session_results",
                "session_id": session_id,
                "limit": 1,
            }),
        )
        .await?;
        let progress: StatusCounts = serde_json::from_value(response.body["progress"].clone())
            .context("decoding progress")?;
        tracing::debug!(finished = progress.finished(), total = progress.total(), "waiting");
        if progress.is_finished() {
            return Ok(progress);
        }
        sleep(Duration::from_millis(50)).await;
    }
}
