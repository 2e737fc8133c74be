//! Error types for dispatcher operations.

use thiserror::Error;

use super::task::{TaskFailure, TaskId, WorkerId};

/// Errors produced by the dispatcher and the components behind it.
///
/// Every submitted task either resolves with a value or rejects with exactly
/// one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A worker unit failed to start.
    #[error("worker spawn failed: {0}")]
    Spawn(String),
    /// All workers are busy and the waiter queue is full.
    #[error("pool saturated")]
    PoolSaturated,
    /// A task id was registered twice.
    #[error("duplicate task id {0}")]
    DuplicateTask(TaskId),
    /// The worker running the task exited unexpectedly.
    #[error("worker {worker} crashed (exit code {exit_code:?})")]
    WorkerCrashed {
        /// Worker that died.
        worker: WorkerId,
        /// Exit code, if the unit reported one.
        exit_code: Option<i32>,
    },
    /// No result arrived before the task's deadline.
    #[error("task timed out")]
    Timeout,
    /// The task function reported a failure.
    #[error("task failed: {0}")]
    Task(TaskFailure),
    /// The caller cancelled the task.
    #[error("task cancelled")]
    Cancelled,
    /// The dispatcher stopped before the task completed.
    #[error("dispatcher has been shut down")]
    Shutdown,
    /// A worker unit's inbox is closed.
    #[error("worker {0} is not accepting tasks")]
    WorkerUnavailable(WorkerId),
    /// A malformed message crossed the worker boundary.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Internal bookkeeping was asked to do something impossible.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DispatchError {
    /// Stable snake_case label for logs and API responses.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn_error",
            Self::PoolSaturated => "pool_saturated",
            Self::DuplicateTask(_) => "duplicate_task",
            Self::WorkerCrashed { .. } => "worker_crashed",
            Self::Timeout => "timeout",
            Self::Task(_) => "task_error",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
            Self::WorkerUnavailable(_) => "worker_unavailable",
            Self::Protocol(_) => "protocol_error",
            Self::Invariant(_) => "invariant_violation",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }

    /// Whether resubmitting the same payload may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolSaturated | Self::WorkerCrashed { .. } | Self::Timeout
        )
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
