//! Messages crossing the coordinator/worker boundary.
//!
//! In-process workers exchange these values over channels. Process workers
//! exchange them as JSON, one message per line, over the child's stdin and
//! stdout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::DispatchError;
use super::task::{Task, TaskFailure, TaskId};

/// Coordinator to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest<P> {
    /// Run one task.
    Task {
        /// Task identifier, echoed back in the reply.
        id: TaskId,
        /// Submission time in milliseconds since epoch.
        created_at_ms: u64,
        /// Opaque input.
        payload: P,
    },
}

impl<P> From<Task<P>> for WorkerRequest<P> {
    fn from(task: Task<P>) -> Self {
        Self::Task {
            id: task.meta.id,
            created_at_ms: task.meta.created_at_ms,
            payload: task.payload,
        }
    }
}

/// Worker to coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage<R> {
    /// Startup handshake; sent once before any reply.
    Ready,
    /// The task completed.
    Result {
        /// Task identifier.
        id: TaskId,
        /// Output value.
        value: R,
    },
    /// The task function reported an error.
    Failure {
        /// Task identifier.
        id: TaskId,
        /// Error payload, passed to the caller verbatim.
        error: TaskFailure,
    },
}

impl<R> WorkerMessage<R> {
    /// The task this message answers, if any.
    pub const fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Ready => None,
            Self::Result { id, .. } | Self::Failure { id, .. } => Some(*id),
        }
    }
}

/// What the coordinator observes from a worker unit.
///
/// `Faulted` and `Exited` are raised by the unit's supervisor, never sent by
/// the task code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent<R> {
    /// A protocol message.
    Message(WorkerMessage<R>),
    /// The unit sent a line that is not a valid message. The unit is being
    /// killed; an `Exited` for it may follow.
    Faulted {
        /// Decode error.
        reason: String,
    },
    /// The unit terminated.
    Exited {
        /// Exit code; `None` when terminated by a signal.
        code: Option<i32>,
    },
}

/// Serialize one message as a newline-terminated JSON line.
///
/// # Errors
///
/// Returns `DispatchError::Protocol` if the value cannot be serialized.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, DispatchError> {
    let mut line =
        serde_json::to_string(message).map_err(|e| DispatchError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Parse one JSON line.
///
/// # Errors
///
/// Returns `DispatchError::Protocol` if the line is not a valid message.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, DispatchError> {
    serde_json::from_str(line.trim_end()).map_err(|e| DispatchError::Protocol(e.to_string()))
}
