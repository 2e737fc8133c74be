//! Dispatcher statistics.
//!
//! Cumulative counters are lock-free atomics bumped by the coordinator; the
//! worker-state view is a snapshot the coordinator republishes after every
//! event, so `Dispatcher::stats()` never waits on it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time view of dispatcher health and throughput.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Configured number of worker units.
    pub pool_size: usize,
    /// Units ready for work.
    pub idle_workers: usize,
    /// Units running a task.
    pub busy_workers: usize,
    /// Crashed units awaiting replacement.
    pub crashed_workers: usize,
    /// Tasks waiting for a unit.
    pub queued_tasks: usize,
    /// Tasks with a pending caller.
    pub in_flight_tasks: usize,
    /// Total tasks submitted.
    pub submitted: u64,
    /// Tasks resolved with a value.
    pub completed: u64,
    /// Tasks rejected with a task failure or a malformed worker reply.
    pub failed: u64,
    /// Tasks rejected with `Timeout`.
    pub timed_out: u64,
    /// Tasks rejected with `WorkerCrashed`.
    pub crashed: u64,
    /// Tasks rejected with `PoolSaturated`.
    pub saturated: u64,
    /// Tasks cancelled by their caller.
    pub cancelled: u64,
    /// Worker replies that arrived with no pending caller.
    pub late_messages: u64,
    /// Worker units that exited unexpectedly.
    pub worker_crashes: u64,
}

/// Worker-state half of [`DispatcherStats`], published by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolSnapshot {
    pub pool_size: usize,
    pub idle: usize,
    pub busy: usize,
    pub crashed: usize,
    pub queued: usize,
    pub in_flight: usize,
}

/// Internal counters for dispatcher statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub crashed: AtomicU64,
    pub saturated: AtomicU64,
    pub cancelled: AtomicU64,
    pub late_messages: AtomicU64,
    pub worker_crashes: AtomicU64,
}

impl DispatchCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Combine counters with the latest pool snapshot.
    pub fn snapshot(&self, pool: PoolSnapshot) -> DispatcherStats {
        DispatcherStats {
            pool_size: pool.pool_size,
            idle_workers: pool.idle,
            busy_workers: pool.busy,
            crashed_workers: pool.crashed,
            queued_tasks: pool.queued,
            in_flight_tasks: pool.in_flight,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            crashed: self.crashed.load(Ordering::Relaxed),
            saturated: self.saturated.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            late_messages: self.late_messages.load(Ordering::Relaxed),
            worker_crashes: self.worker_crashes.load(Ordering::Relaxed),
        }
    }
}
