//! Fixed-size pool of worker units with a bounded FIFO waiter queue.
//!
//! The pool is plain data owned by the coordinator; it never blocks and
//! never spawns. Callers that find no idle unit are queued up to
//! `waiter_cap` and are handed a unit directly when one is released, so a
//! released unit never sits idle while a waiter exists.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::DispatchError;
use super::task::{Task, TaskId, WorkerId};
use super::worker::WorkerUnit;

/// Lifecycle of a worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for a task.
    Idle,
    /// Running (or about to receive) a task.
    Busy,
    /// Exited unexpectedly; terminal until replaced by a new unit.
    Crashed,
    /// Being stopped.
    ShuttingDown,
}

/// The pool's view of one worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// Unit identity.
    pub id: WorkerId,
    /// Current state.
    pub state: WorkerState,
    /// Task the unit is running, if any.
    pub current_task: Option<TaskId>,
}

/// Result of [`WorkerPool::acquire`].
#[derive(Debug)]
pub enum Acquire<P> {
    /// An idle unit was marked busy for this task.
    Granted(WorkerId, Task<P>),
    /// No unit is idle; the task waits in FIFO order.
    Queued,
    /// No unit is idle and the waiter queue is full.
    Saturated(Task<P>),
}

/// What the pool recorded when a unit died or was forcibly replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashReport {
    /// The unit that died.
    pub worker: WorkerId,
    /// Task it was running.
    pub in_flight: Option<TaskId>,
    /// Exit code, if known.
    pub exit_code: Option<i32>,
}

struct Slot<U> {
    handle: WorkerHandle,
    unit: Option<U>,
}

/// Fixed-capacity pool of worker units.
pub struct WorkerPool<P, U> {
    capacity: usize,
    waiter_cap: usize,
    slots: BTreeMap<WorkerId, Slot<U>>,
    idle: VecDeque<WorkerId>,
    waiters: VecDeque<Task<P>>,
    next_id: u64,
}

impl<P, U> WorkerPool<P, U>
where
    U: WorkerUnit<P>,
{
    /// Empty pool for `capacity` units and up to `waiter_cap` queued tasks.
    #[must_use]
    pub fn new(capacity: usize, waiter_cap: usize) -> Self {
        Self {
            capacity,
            waiter_cap,
            slots: BTreeMap::new(),
            idle: VecDeque::with_capacity(capacity),
            waiters: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Reserve a fresh worker identity.
    pub fn allocate_id(&mut self) -> WorkerId {
        self.next_id += 1;
        WorkerId(self.next_id)
    }

    /// Add a ready unit, evicting one crashed handle if the pool is full.
    ///
    /// If a task is waiting, the unit is handed to it immediately and the
    /// pair is returned for sending.
    ///
    /// # Errors
    ///
    /// Gives the unit back if the pool has no room for it.
    pub fn install(&mut self, unit: U) -> Result<Option<(WorkerId, Task<P>)>, U> {
        if self.slots.len() >= self.capacity {
            let crashed = self
                .slots
                .iter()
                .find(|(_, slot)| slot.handle.state == WorkerState::Crashed)
                .map(|(id, _)| *id);
            let Some(crashed) = crashed else {
                return Err(unit);
            };
            self.slots.remove(&crashed);
            debug!(replaced = %crashed, worker_id = %unit.id(), "replacing crashed worker");
        }

        let id = unit.id();
        let mut handle = WorkerHandle {
            id,
            state: WorkerState::Idle,
            current_task: None,
        };
        let granted = self.waiters.pop_front().map(|task| {
            handle.state = WorkerState::Busy;
            (id, task)
        });
        if granted.is_none() {
            self.idle.push_back(id);
        }
        self.slots.insert(
            id,
            Slot {
                handle,
                unit: Some(unit),
            },
        );
        Ok(granted)
    }

    /// Obtain an idle unit for `task`, or queue it, or refuse it.
    pub fn acquire(&mut self, task: Task<P>) -> Acquire<P> {
        while let Some(id) = self.idle.pop_front() {
            if let Some(slot) = self.slots.get_mut(&id) {
                if slot.handle.state == WorkerState::Idle {
                    slot.handle.state = WorkerState::Busy;
                    return Acquire::Granted(id, task);
                }
            }
        }
        if self.waiters.len() < self.waiter_cap {
            self.waiters.push_back(task);
            return Acquire::Queued;
        }
        Acquire::Saturated(task)
    }

    /// Send `task` to a unit previously granted by `acquire`, `install` or
    /// `release`.
    ///
    /// # Errors
    ///
    /// Returns `Invariant` if the unit is not busy and free, or the unit's own
    /// send error. On a unit error the handle keeps `current_task` so a
    /// subsequent [`crash`](Self::crash) reports it.
    pub fn send(&mut self, worker: WorkerId, task: Task<P>) -> Result<(), DispatchError> {
        let Some(slot) = self.slots.get_mut(&worker) else {
            return Err(DispatchError::Invariant(format!("send to unknown worker {worker}")));
        };
        if slot.handle.state != WorkerState::Busy || slot.handle.current_task.is_some() {
            return Err(DispatchError::Invariant(format!(
                "send to {worker} in state {:?}",
                slot.handle.state
            )));
        }
        let Some(unit) = slot.unit.as_mut() else {
            return Err(DispatchError::WorkerUnavailable(worker));
        };
        slot.handle.current_task = Some(task.id());
        unit.send(task)
    }

    /// Return a unit that finished `task_id`.
    ///
    /// If a task is waiting, the unit stays busy and is returned with it.
    ///
    /// # Errors
    ///
    /// Returns `Invariant` if the unit is unknown or not busy with
    /// `task_id`; nothing is changed in that case.
    pub fn release(
        &mut self,
        worker: WorkerId,
        task_id: TaskId,
    ) -> Result<Option<(WorkerId, Task<P>)>, DispatchError> {
        let Some(slot) = self.slots.get_mut(&worker) else {
            return Err(DispatchError::Invariant(format!("release of unknown worker {worker}")));
        };
        if slot.handle.state != WorkerState::Busy || slot.handle.current_task != Some(task_id) {
            return Err(DispatchError::Invariant(format!(
                "release of {worker} for {task_id} while {:?} with {:?}",
                slot.handle.state, slot.handle.current_task
            )));
        }
        slot.handle.current_task = None;
        if let Some(next) = self.waiters.pop_front() {
            return Ok(Some((worker, next)));
        }
        slot.handle.state = WorkerState::Idle;
        self.idle.push_back(worker);
        Ok(None)
    }

    /// Return a busy unit that has no task assigned (the task it was
    /// granted for went away before sending).
    pub fn release_unassigned(&mut self, worker: WorkerId) -> Option<(WorkerId, Task<P>)> {
        let slot = self.slots.get_mut(&worker)?;
        if slot.handle.state != WorkerState::Busy || slot.handle.current_task.is_some() {
            return None;
        }
        if let Some(next) = self.waiters.pop_front() {
            return Some((worker, next));
        }
        slot.handle.state = WorkerState::Idle;
        self.idle.push_back(worker);
        None
    }

    /// Record that a unit exited. The unit is dropped and its handle stays
    /// `Crashed` until a replacement is installed.
    ///
    /// Returns `None` for unknown, already crashed, or shutting-down units.
    pub fn crash(&mut self, worker: WorkerId, exit_code: Option<i32>) -> Option<CrashReport> {
        let slot = self.slots.get_mut(&worker)?;
        if matches!(
            slot.handle.state,
            WorkerState::Crashed | WorkerState::ShuttingDown
        ) {
            return None;
        }
        slot.handle.state = WorkerState::Crashed;
        let in_flight = slot.handle.current_task.take();
        slot.unit = None;
        self.idle.retain(|id| *id != worker);
        warn!(worker_id = %worker, exit_code = ?exit_code, in_flight = ?in_flight, "worker crashed");
        Some(CrashReport {
            worker,
            in_flight,
            exit_code,
        })
    }

    /// Kill a unit mid-task and record it as crashed.
    pub fn force_replace(&mut self, worker: WorkerId) -> Option<CrashReport> {
        if let Some(unit) = self.slots.get_mut(&worker).and_then(|slot| slot.unit.as_mut()) {
            unit.kill();
        }
        self.crash(worker, None)
    }

    /// The unit currently running `task_id`.
    #[must_use]
    pub fn worker_for(&self, task_id: TaskId) -> Option<WorkerId> {
        self.slots
            .values()
            .find(|slot| slot.handle.current_task == Some(task_id))
            .map(|slot| slot.handle.id)
    }

    /// Remove a queued task before it is sent anywhere.
    pub fn remove_waiter(&mut self, task_id: TaskId) -> Option<Task<P>> {
        let pos = self.waiters.iter().position(|task| task.id() == task_id)?;
        self.waiters.remove(pos)
    }

    /// Take every queued task.
    pub fn drain_waiters(&mut self) -> Vec<Task<P>> {
        self.waiters.drain(..).collect()
    }

    /// Mark all live units as shutting down and hand them over for stopping.
    pub fn begin_shutdown(&mut self) -> Vec<U> {
        self.idle.clear();
        self.slots
            .values_mut()
            .filter_map(|slot| {
                let unit = slot.unit.take()?;
                slot.handle.state = WorkerState::ShuttingDown;
                Some(unit)
            })
            .collect()
    }

    /// Handle for one unit.
    #[must_use]
    pub fn handle(&self, worker: WorkerId) -> Option<&WorkerHandle> {
        self.slots.get(&worker).map(|slot| &slot.handle)
    }

    /// All handles, ordered by id.
    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.slots.values().map(|slot| &slot.handle)
    }

    fn count(&self, state: WorkerState) -> usize {
        self.handles().filter(|handle| handle.state == state).count()
    }

    /// Units ready for work.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.count(WorkerState::Idle)
    }

    /// Units running a task.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.count(WorkerState::Busy)
    }

    /// Crashed units awaiting replacement.
    #[must_use]
    pub fn crashed_count(&self) -> usize {
        self.count(WorkerState::Crashed)
    }

    /// Tasks waiting for a unit.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Configured number of units.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of handles, crashed ones included. Never exceeds capacity.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
