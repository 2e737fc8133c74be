//! Task registry: routes asynchronous worker outcomes to waiting callers.
//!
//! Each in-flight task has exactly one [`PendingEntry`] holding the caller's
//! continuation. Every removal path (resolve, reject, expiry) takes the entry
//! out of the map before invoking the continuation, so a second removal for
//! the same id finds nothing and is a no-op.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::error::DispatchError;
use super::task::{TaskId, TaskState};

/// Outcome delivered to the caller.
pub type Outcome<R> = Result<R, DispatchError>;

/// The caller's pending continuation.
pub type Continuation<R> = oneshot::Sender<Outcome<R>>;

/// Bookkeeping linking a task to the caller awaiting it.
#[derive(Debug)]
pub struct PendingEntry<R> {
    /// Task identifier.
    pub task_id: TaskId,
    /// Where the outcome goes.
    pub continuation: Continuation<R>,
    /// When the caller stops waiting.
    pub deadline: Option<Instant>,
    /// `Submitted` or `Dispatched`.
    pub state: TaskState,
}

/// Map of in-flight tasks with deadline tracking.
#[derive(Debug)]
pub struct TaskRegistry<R> {
    entries: HashMap<TaskId, PendingEntry<R>>,
    deadlines: BTreeSet<(Instant, TaskId)>,
}

impl<R> Default for TaskRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> TaskRegistry<R> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            deadlines: BTreeSet::new(),
        }
    }

    /// Register a pending task.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::DuplicateTask` if `task_id` is already
    /// present. The given continuation is rejected with the same error; the
    /// existing entry is left untouched.
    pub fn register(
        &mut self,
        task_id: TaskId,
        continuation: Continuation<R>,
        deadline: Option<Instant>,
    ) -> Result<(), DispatchError> {
        if self.entries.contains_key(&task_id) {
            let _ = continuation.send(Err(DispatchError::DuplicateTask(task_id)));
            return Err(DispatchError::DuplicateTask(task_id));
        }
        if let Some(at) = deadline {
            self.deadlines.insert((at, task_id));
        }
        self.entries.insert(
            task_id,
            PendingEntry {
                task_id,
                continuation,
                deadline,
                state: TaskState::Submitted,
            },
        );
        Ok(())
    }

    /// Record that the task was sent to a worker.
    ///
    /// Returns `false` if the task is no longer pending.
    pub fn mark_dispatched(&mut self, task_id: TaskId) -> bool {
        self.entries.get_mut(&task_id).is_some_and(|entry| {
            entry.state = TaskState::Dispatched;
            true
        })
    }

    /// Deliver a value. No-op returning `false` if the entry is gone.
    pub fn resolve(&mut self, task_id: TaskId, value: R) -> bool {
        self.complete(task_id, Ok(value))
    }

    /// Deliver an error. No-op returning `false` if the entry is gone.
    pub fn reject(&mut self, task_id: TaskId, error: DispatchError) -> bool {
        self.complete(task_id, Err(error))
    }

    fn complete(&mut self, task_id: TaskId, outcome: Outcome<R>) -> bool {
        let Some(entry) = self.take(task_id) else {
            debug!(task_id = %task_id, "no pending entry; outcome dropped");
            return false;
        };
        if entry.continuation.send(outcome).is_err() {
            debug!(task_id = %task_id, "caller stopped waiting before the outcome arrived");
        }
        true
    }

    fn take(&mut self, task_id: TaskId) -> Option<PendingEntry<R>> {
        let entry = self.entries.remove(&task_id)?;
        if let Some(at) = entry.deadline {
            self.deadlines.remove(&(at, task_id));
        }
        Some(entry)
    }

    /// Reject every entry whose deadline is at or before `now` with
    /// `Timeout`, returning their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<TaskId> {
        let mut expired = Vec::new();
        while let Some(&(at, task_id)) = self.deadlines.first() {
            if at > now {
                break;
            }
            if self.reject(task_id, DispatchError::Timeout) {
                expired.push(task_id);
            } else {
                self.deadlines.remove(&(at, task_id));
            }
        }
        expired
    }

    /// Earliest deadline among pending entries.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|&(at, _)| at)
    }

    /// Reject all pending entries with clones of `error`.
    pub fn reject_all(&mut self, error: &DispatchError) -> usize {
        let ids: Vec<TaskId> = self.entries.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.reject(*id, error.clone()))
            .count()
    }

    /// Lifecycle state of a pending task.
    #[must_use]
    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.entries.get(&task_id).map(|entry| entry.state)
    }

    /// Whether the task is still pending.
    #[must_use]
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.contains_key(&task_id)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
