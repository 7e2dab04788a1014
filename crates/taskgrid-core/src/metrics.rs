//! Metrics - `metrics` facade 経由のカウンタとヒストグラム
//!
//! 構造化ログを補うための数値。recorder（Prometheus exporter など）の導入は
//! バイナリ側の責務で、ここでは facade に書くだけです。
//! `METRICS_ARE_ENABLED` が偽なら [`GridMetrics`] は何も記録しません。
//!
//! | metric | type | labels |
//! |--------|------|--------|
//! | `taskgrid_requests_total` | Counter | `handler`, `result` |
//! | `taskgrid_request_duration_seconds` | Histogram | `handler` |
//! | `taskgrid_tasks_submitted_total` | Counter | `priority`, `payload` |
//! | `taskgrid_enqueue_rollbacks_total` | Counter | `handler` |
//! | `taskgrid_cancels_total` | Counter | `outcome` |
//! | `taskgrid_result_cache_lookups_total` | Counter | `result` |
//! | `taskgrid_sweep_tasks_total` | Counter | `outcome` |

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

use crate::app::ttl_checker::SweepReport;
use crate::domain::Result;

pub mod names {
    pub const REQUESTS_TOTAL: &str = "taskgrid_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "taskgrid_request_duration_seconds";
    pub const TASKS_SUBMITTED_TOTAL: &str = "taskgrid_tasks_submitted_total";
    pub const ENQUEUE_ROLLBACKS_TOTAL: &str = "taskgrid_enqueue_rollbacks_total";
    pub const CANCELS_TOTAL: &str = "taskgrid_cancels_total";
    pub const RESULT_CACHE_LOOKUPS_TOTAL: &str = "taskgrid_result_cache_lookups_total";
    pub const SWEEP_TASKS_TOTAL: &str = "taskgrid_sweep_tasks_total";
}

pub mod labels {
    /// submit, submit_batch, cancel, get_result, get_session_results, ttl_checker
    pub const HANDLER: &str = "handler";
    /// `ok` or a `GridError::code()`
    pub const RESULT: &str = "result";
    pub const PRIORITY: &str = "priority";
    /// inline / external
    pub const PAYLOAD: &str = "payload";
    pub const OUTCOME: &str = "outcome";
}

/// Registers metric descriptions. Call once after installing a recorder.
pub fn register_metrics() {
    describe_counter!(names::REQUESTS_TOTAL, "Handler invocations by result");
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Handler latency in seconds"
    );
    describe_counter!(names::TASKS_SUBMITTED_TOTAL, "Tasks accepted by submit");
    describe_counter!(
        names::ENQUEUE_ROLLBACKS_TOTAL,
        "Tasks failed because their queue message could not be sent"
    );
    describe_counter!(names::CANCELS_TOTAL, "Cancel requests by outcome");
    describe_counter!(
        names::RESULT_CACHE_LOOKUPS_TOTAL,
        "Result cache lookups by hit or miss"
    );
    describe_counter!(names::SWEEP_TASKS_TOTAL, "Stale tasks handled by the sweeper");
}

/// Handle shared by the services. Copy it freely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridMetrics {
    enabled: bool,
}

impl GridMetrics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_request<T>(
        &self,
        handler: &'static str,
        result: &Result<T>,
        elapsed: Duration,
    ) {
        if !self.enabled {
            return;
        }
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        counter!(
            names::REQUESTS_TOTAL,
            labels::HANDLER => handler,
            labels::RESULT => outcome,
        )
        .increment(1);
        histogram!(names::REQUEST_DURATION_SECONDS, labels::HANDLER => handler)
            .record(elapsed.as_secs_f64());
    }

    pub fn record_submitted(&self, priority: u32, external: bool) {
        if !self.enabled {
            return;
        }
        let payload = if external { "external" } else { "inline" };
        counter!(
            names::TASKS_SUBMITTED_TOTAL,
            labels::PRIORITY => priority.to_string(),
            labels::PAYLOAD => payload,
        )
        .increment(1);
    }

    pub fn record_rollback(&self, handler: &'static str) {
        if !self.enabled {
            return;
        }
        counter!(names::ENQUEUE_ROLLBACKS_TOTAL, labels::HANDLER => handler).increment(1);
    }

    pub fn record_cancel(&self, cancelled: bool) {
        if !self.enabled {
            return;
        }
        let outcome = if cancelled { "cancelled" } else { "already_terminal" };
        counter!(names::CANCELS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if !self.enabled {
            return;
        }
        let result = if hit { "hit" } else { "miss" };
        counter!(names::RESULT_CACHE_LOOKUPS_TOTAL, labels::RESULT => result).increment(1);
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        if !self.enabled {
            return;
        }
        for (outcome, n) in [
            ("requeued", report.requeued),
            ("expired", report.expired),
            ("superseded", report.superseded),
            ("failed", report.failed),
        ] {
            if n > 0 {
                counter!(names::SWEEP_TASKS_TOTAL, labels::OUTCOME => outcome)
                    .increment(n as u64);
            }
        }
    }
}
