//! Task status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
///
/// State transitions:
/// - Pending -> Running (worker claim)
/// - Running -> Running (heartbeat renewal)
/// - Running -> Pending (sweeper requeue of an abandoned claim)
/// - Running -> Completed | Failed (worker terminal write)
/// - Pending | Running -> Cancelled (cancel service)
/// - Running -> Expired (sweeper, retries exhausted)
/// - Pending -> Failed (dispatch rollback when no queue entry could be written)
///
/// Serialized as SCREAMING_SNAKE_CASE so index keys read `RUNNING`, `PENDING`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Admitted and waiting in a queue shard.
    Pending,

    /// Claimed by a worker; heartbeat expiration is set.
    Running,

    Completed,

    Failed,

    Cancelled,

    /// Abandoned too many times; given up by the sweeper.
    Expired,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Expired,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Pending)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}
