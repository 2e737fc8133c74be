//! API-facing request/response models.
//!
//! Transport-agnostic: an HTTP handler or RPC method deserializes a
//! [`SubmitRequest`], calls [`submit_request`], and serializes the
//! [`SubmitResponse`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{DispatchError, Dispatcher, TaskId};

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest<P> {
    /// Opaque payload handed to the worker.
    pub payload: P,
    /// Per-task timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// How a task settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome<R> {
    /// The worker produced a value.
    Ok {
        /// The value.
        value: R,
    },
    /// The task was rejected.
    Err {
        /// Stable error label, see [`DispatchError::kind`].
        kind: String,
        /// Human-readable description.
        message: String,
        /// Whether resubmitting may succeed.
        retryable: bool,
    },
}

impl<R> From<Result<R, DispatchError>> for TaskOutcome<R> {
    fn from(outcome: Result<R, DispatchError>) -> Self {
        match outcome {
            Ok(value) => Self::Ok { value },
            Err(e) => Self::Err {
                kind: e.kind().to_string(),
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
        }
    }
}

/// Task submission response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse<R> {
    /// Task identifier.
    pub task_id: TaskId,
    /// Final outcome.
    pub outcome: TaskOutcome<R>,
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag: running and not every unit crashed.
    pub ok: bool,
    /// Units ready for work.
    pub idle_workers: usize,
    /// Units running a task.
    pub busy_workers: usize,
    /// Crashed units awaiting replacement.
    pub crashed_workers: usize,
    /// Tasks waiting for a unit.
    pub queued_tasks: usize,
}

/// Submit a request and wait for its outcome.
pub async fn submit_request<P, R>(
    dispatcher: &Dispatcher<P, R>,
    req: SubmitRequest<P>,
) -> SubmitResponse<R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    let handle = match req.timeout_ms {
        Some(ms) => dispatcher.submit_with_timeout(req.payload, Duration::from_millis(ms)),
        None => dispatcher.submit(req.payload),
    };
    let task_id = handle.id();
    SubmitResponse {
        task_id,
        outcome: handle.await.into(),
    }
}

/// Return a health payload.
#[must_use]
pub fn health<P, R>(dispatcher: &Dispatcher<P, R>) -> Health
where
    P: Send + 'static,
    R: Send + 'static,
{
    let stats = dispatcher.stats();
    Health {
        ok: dispatcher.is_running() && stats.crashed_workers < stats.pool_size,
        idle_workers: stats.idle_workers,
        busy_workers: stats.busy_workers,
        crashed_workers: stats.crashed_workers,
        queued_tasks: stats.queued_tasks,
    }
}
