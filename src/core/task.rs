//! Task and worker identity types.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::clock::now_ms;

/// Unique identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a worker unit. A replacement unit always gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Metadata handed to the executor alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Task identifier.
    pub id: TaskId,
    /// Submission time in milliseconds since epoch.
    pub created_at_ms: u64,
}

impl TaskMeta {
    /// Metadata for a task created now.
    #[must_use]
    pub fn now(id: TaskId) -> Self {
        Self {
            id,
            created_at_ms: now_ms(),
        }
    }
}

/// A unit of work: immutable once created by the dispatcher.
#[derive(Debug, Clone)]
pub struct Task<P> {
    /// Identity and creation time.
    pub meta: TaskMeta,
    /// Opaque input for the executor.
    pub payload: P,
}

impl<P> Task<P> {
    /// Create a task with a fresh id.
    pub fn new(payload: P) -> Self {
        Self {
            meta: TaskMeta::now(TaskId::new()),
            payload,
        }
    }

    /// The task's identifier.
    pub const fn id(&self) -> TaskId {
        self.meta.id
    }
}

/// Lifecycle of a task inside the dispatcher.
///
/// `Resolved`, `Rejected` and `TimedOut` are terminal; a task leaves
/// `Dispatched` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered, waiting for a worker.
    Submitted,
    /// Sent to a worker.
    Dispatched,
    /// Result delivered to the caller.
    Resolved,
    /// Failure delivered to the caller.
    Rejected,
    /// Deadline passed before a result arrived.
    TimedOut,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected | Self::TimedOut)
    }
}

/// Error payload produced by the task function itself.
///
/// Passed through to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskFailure(pub String);

impl TaskFailure {
    /// Build a failure from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskFailure {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskFailure {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new(1_u32);
        let b = Task::new(1_u32);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Submitted.is_terminal());
        assert!(!TaskState::Dispatched.is_terminal());
        assert!(TaskState::Resolved.is_terminal());
        assert!(TaskState::Rejected.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
    }

    #[test]
    fn test_task_failure_serializes_as_plain_string() {
        let json = serde_json::to_string(&TaskFailure::new("boom")).unwrap();
        assert_eq!(json, "\"boom\"");
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(7).to_string(), "w7");
    }
}
