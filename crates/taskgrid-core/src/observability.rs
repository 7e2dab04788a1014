//! Observability - ログ初期化と状態別カウント
//!
//! - `init_logging`: tracing-subscriber の初期化（`TASKGRID_LOG` でレベル指定）
//! - `StatusCounts`: セッション進捗やストア全体の状態別件数

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::domain::TaskStatus;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "TASKGRID_LOG";

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem. Later calls are no-ops.
///
/// `TASKGRID_LOG` controls levels (e.g. `info`, `taskgrid_core::app=debug`),
/// defaulting to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

        // try_init: a test harness may already own the global subscriber
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Span for one service operation on one task.
#[must_use]
pub fn task_span(operation: &'static str, task_id: impl std::fmt::Display) -> Span {
    tracing::info_span!("task", op = operation, task_id = %task_id)
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub expired: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
            TaskStatus::Expired => &mut self.expired,
        };
        *slot += 1;
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
            TaskStatus::Expired => self.expired,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Tasks in a terminal state.
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled + self.expired
    }

    pub fn is_finished(&self) -> bool {
        self.total() > 0 && self.finished() == self.total()
    }
}

impl FromIterator<TaskStatus> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut counts = Self::default();
        for status in iter {
            counts.record(status);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn task_span_can_be_entered() {
        let span = task_span("submit", "task-01");
        let _guard = span.enter();
        tracing::info!("inside span");
    }

    #[test]
    fn counts_track_progress() {
        let counts: StatusCounts = [
            TaskStatus::Pending,
            TaskStatus::Completed,
            TaskStatus::Completed,
            TaskStatus::Expired,
        ]
        .into_iter()
        .collect();

        assert_eq!(counts.completed, 2);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.finished(), 3);
        assert!(!counts.is_finished());
        assert!(!StatusCounts::default().is_finished());
    }
}
