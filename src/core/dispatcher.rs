//! Dispatcher façade and the coordinating task behind it.
//!
//! All pool and registry state lives in one tokio task (the coordinator).
//! `Dispatcher` handles talk to it over a command channel, worker units
//! report on an event channel, and replacement spawns report on a third.
//! Nothing the coordinator owns is shared, so none of it is locked.
//!
//! ```rust,ignore
//! use offload_dispatcher::config::DispatcherConfig;
//! use offload_dispatcher::core::{Dispatcher, FnExecutor, ThreadWorkerFactory};
//!
//! let config = DispatcherConfig::new().with_pool_size(4).with_waiter_queue_cap(16);
//! let factory = ThreadWorkerFactory::from_config(FnExecutor::new(fibonacci), &config);
//! let dispatcher = Dispatcher::start(config, factory).await?;
//!
//! let value = dispatcher.submit(40).await?;
//! dispatcher.shutdown().await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::DispatchError;
use super::pool::{Acquire, WorkerPool};
use super::protocol::{WorkerEvent, WorkerMessage};
use super::registry::{Continuation, Outcome, TaskRegistry};
use super::stats::{DispatchCounters, DispatcherStats, PoolSnapshot};
use super::task::{Task, TaskId, TaskState, WorkerId};
use super::worker::{EventReceiver, EventSender, WorkerFactory, WorkerUnit};
use crate::config::DispatcherConfig;

enum Command<P, R> {
    Submit {
        task: Task<P>,
        deadline: Option<Instant>,
        continuation: Continuation<R>,
    },
    Cancel {
        task_id: TaskId,
        force: bool,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct Spawned<U> {
    worker: WorkerId,
    attempt: u32,
    result: Result<U, DispatchError>,
}

/// Awaitable outcome of a submitted task.
///
/// Resolves to the task's value or to exactly one `DispatchError`.
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<R> {
    id: TaskId,
    rx: oneshot::Receiver<Outcome<R>>,
}

impl<R> TaskHandle<R> {
    /// Identifier of the submitted task, for `cancel` and `force_cancel`.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Outcome<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped continuation means the coordinator is gone.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::Shutdown)))
    }
}

/// Public entry point: accepts tasks and resolves callers asynchronously.
///
/// Cheap to clone; all clones drive the same coordinator. The coordinator
/// shuts down when [`shutdown`](Self::shutdown) is called or the last clone
/// is dropped.
pub struct Dispatcher<P, R> {
    commands: mpsc::UnboundedSender<Command<P, R>>,
    default_timeout: Duration,
    counters: Arc<DispatchCounters>,
    snapshot: Arc<RwLock<PoolSnapshot>>,
}

impl<P, R> Clone for Dispatcher<P, R> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            default_timeout: self.default_timeout,
            counters: Arc::clone(&self.counters),
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

impl<P, R> Dispatcher<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Spawn `config.pool_size` workers and start the coordinator.
    ///
    /// # Errors
    ///
    /// - `DispatchError::InvalidConfig` if the configuration is invalid
    /// - `DispatchError::Spawn` if any initial worker fails to start; workers
    ///   already started are stopped
    pub async fn start<F>(config: DispatcherConfig, factory: F) -> Result<Self, DispatchError>
    where
        F: WorkerFactory<P, R>,
    {
        config.validate().map_err(DispatchError::InvalidConfig)?;

        let factory = Arc::new(factory);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(config.pool_size, config.waiter_queue_cap);

        for _ in 0..config.pool_size {
            let id = pool.allocate_id();
            match factory.spawn(id, events_tx.clone()).await {
                Ok(unit) => {
                    if let Err(unit) = pool.install(unit) {
                        unit.stop(config.worker_grace()).await;
                    }
                }
                Err(e) => {
                    error!(worker_id = %id, error = %e, "initial worker failed to start");
                    stop_all::<_, P>(pool.begin_shutdown(), config.worker_grace()).await;
                    return Err(e);
                }
            }
        }

        let counters = Arc::new(DispatchCounters::default());
        let snapshot = Arc::new(RwLock::new(PoolSnapshot::default()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (spawned_tx, spawned_rx) = mpsc::unbounded_channel();

        info!(
            pool_size = config.pool_size,
            waiter_queue_cap = config.waiter_queue_cap,
            task_timeout_ms = config.task_timeout_ms,
            "dispatcher started"
        );

        let default_timeout = config.task_timeout();
        let coordinator = Coordinator {
            config,
            factory,
            pool,
            registry: TaskRegistry::new(),
            counters: Arc::clone(&counters),
            snapshot: Arc::clone(&snapshot),
            events_tx,
            spawned_tx,
        };
        coordinator.publish();
        tokio::spawn(coordinator.run(commands_rx, events_rx, spawned_rx));

        Ok(Self {
            commands: commands_tx,
            default_timeout,
            counters,
            snapshot,
        })
    }

    /// Submit a task with the configured default timeout.
    pub fn submit(&self, payload: P) -> TaskHandle<R> {
        self.submit_with_timeout(payload, self.default_timeout)
    }

    /// Submit a task that times out after `timeout`.
    ///
    /// Never blocks. Saturation, timeouts and worker failures are all
    /// reported through the returned handle.
    pub fn submit_with_timeout(&self, payload: P, timeout: Duration) -> TaskHandle<R> {
        let task = Task::new(payload);
        let id = task.id();
        let (continuation, rx) = oneshot::channel();
        let deadline = Instant::now().checked_add(timeout);

        // If the coordinator is gone the continuation is dropped here and
        // the handle resolves to `Shutdown`.
        if self
            .commands
            .send(Command::Submit {
                task,
                deadline,
                continuation,
            })
            .is_err()
        {
            debug!(task_id = %id, "submit after shutdown");
        }
        TaskHandle { id, rx }
    }

    /// Cancel a task. A queued task is never sent; a running task keeps
    /// running but its result is discarded. The caller's handle rejects
    /// with `Cancelled`.
    ///
    /// Returns `false` if the task already finished.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        self.request_cancel(task_id, false).await
    }

    /// Cancel a task, killing and replacing the worker if it is running.
    ///
    /// A thread worker cannot be interrupted. Its OS thread is detached and
    /// lives until the running task returns, so live threads may exceed
    /// `pool_size` for a while. Child processes are killed outright.
    ///
    /// Returns `false` if the task already finished.
    pub async fn force_cancel(&self, task_id: TaskId) -> bool {
        self.request_cancel(task_id, true).await
    }

    async fn request_cancel(&self, task_id: TaskId, force: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Cancel {
                task_id,
                force,
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Reject all pending tasks with `Shutdown` and stop every worker,
    /// waiting up to the configured grace period for each.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the coordinator still accepts tasks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Current pool state and cumulative counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot(*self.snapshot.read())
    }
}

async fn stop_all<U, P>(units: Vec<U>, grace: Duration)
where
    U: WorkerUnit<P>,
{
    join_all(units.into_iter().map(|unit| unit.stop(grace))).await;
}

struct Coordinator<P, R, F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: WorkerFactory<P, R>,
{
    config: DispatcherConfig,
    factory: Arc<F>,
    pool: WorkerPool<P, F::Unit>,
    registry: TaskRegistry<R>,
    counters: Arc<DispatchCounters>,
    snapshot: Arc<RwLock<PoolSnapshot>>,
    events_tx: EventSender<R>,
    spawned_tx: mpsc::UnboundedSender<Spawned<F::Unit>>,
}

impl<P, R, F> Coordinator<P, R, F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: WorkerFactory<P, R>,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<P, R>>,
        mut events: EventReceiver<R>,
        mut spawned: mpsc::UnboundedReceiver<Spawned<F::Unit>>,
    ) {
        let done = loop {
            let next_deadline = self.registry.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit { task, deadline, continuation }) => {
                        self.submit(task, deadline, continuation);
                    }
                    Some(Command::Cancel { task_id, force, reply }) => {
                        let cancelled = self.cancel(task_id, force);
                        let _ = reply.send(cancelled);
                    }
                    Some(Command::Shutdown { done }) => break Some(done),
                    None => break None,
                },
                Some((worker, event)) = events.recv() => self.handle_event(worker, event),
                Some(spawned) = spawned.recv() => self.handle_spawned(spawned),
                () = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() => self.expire_overdue(),
            }
            self.publish();
        };

        // Anything still buffered behind the shutdown request is answered
        // once the workers are down.
        commands.close();
        let mut waiting = done.into_iter().collect::<Vec<_>>();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Submit { continuation, .. } => {
                    let _ = continuation.send(Err(DispatchError::Shutdown));
                }
                Command::Cancel { reply, .. } => {
                    let _ = reply.send(false);
                }
                Command::Shutdown { done } => waiting.push(done),
            }
        }

        self.shutdown().await;
        for done in waiting {
            let _ = done.send(());
        }
    }

    fn submit(&mut self, task: Task<P>, deadline: Option<Instant>, continuation: Continuation<R>) {
        let task_id = task.id();
        DispatchCounters::bump(&self.counters.submitted);

        let registered = self.registry.register(task_id, continuation, deadline);
        debug_assert!(registered.is_ok(), "duplicate task id {task_id}");
        if let Err(e) = registered {
            error!(task_id = %task_id, error = %e, "task id collision");
            return;
        }

        match self.pool.acquire(task) {
            Acquire::Granted(worker, task) => self.dispatch(worker, task),
            Acquire::Queued => {
                debug!(task_id = %task_id, waiters = self.pool.waiter_count(), "no idle worker; task queued");
            }
            Acquire::Saturated(_) => {
                warn!(task_id = %task_id, "pool saturated; rejecting task");
                DispatchCounters::bump(&self.counters.saturated);
                self.registry.reject(task_id, DispatchError::PoolSaturated);
            }
        }
    }

    /// Send tasks to workers, following hand-offs until none is left.
    fn dispatch(&mut self, worker: WorkerId, task: Task<P>) {
        let mut next = Some((worker, task));
        while let Some((worker, task)) = next.take() {
            let task_id = task.id();
            if !self.registry.mark_dispatched(task_id) {
                debug!(task_id = %task_id, "caller no longer waiting; task not sent");
                next = self.pool.release_unassigned(worker);
                continue;
            }

            debug!(worker_id = %worker, task_id = %task_id, "dispatching task");
            match self.pool.send(worker, task) {
                Ok(()) => {}
                Err(DispatchError::WorkerUnavailable(_)) => self.on_exit(worker, None),
                Err(e) => {
                    warn!(worker_id = %worker, task_id = %task_id, error = %e, "task could not be sent");
                    self.registry.reject(task_id, e);
                    next = self
                        .pool
                        .release(worker, task_id)
                        .unwrap_or_else(|_| self.pool.release_unassigned(worker));
                }
            }
        }
    }

    fn handle_event(&mut self, worker: WorkerId, event: WorkerEvent<R>) {
        // Deadlines win over replies that raced them.
        self.expire_overdue();

        match event {
            WorkerEvent::Message(WorkerMessage::Result { id, value }) => {
                if self.registry.resolve(id, value) {
                    DispatchCounters::bump(&self.counters.completed);
                    debug!(worker_id = %worker, task_id = %id, "task resolved");
                } else {
                    self.note_late(worker, id);
                }
                self.release(worker, id);
            }
            WorkerEvent::Message(WorkerMessage::Failure { id, error }) => {
                debug!(worker_id = %worker, task_id = %id, error = %error, "task failed in worker");
                if self.registry.reject(id, DispatchError::Task(error)) {
                    DispatchCounters::bump(&self.counters.failed);
                } else {
                    self.note_late(worker, id);
                }
                self.release(worker, id);
            }
            WorkerEvent::Message(WorkerMessage::Ready) => {}
            WorkerEvent::Faulted { reason } => {
                warn!(worker_id = %worker, reason = %reason, "malformed worker reply; replacing worker");
                self.retire(worker, None, DispatchError::Protocol(reason));
            }
            WorkerEvent::Exited { code } => self.on_exit(worker, code),
        }
    }

    fn note_late(&self, worker: WorkerId, task_id: TaskId) {
        DispatchCounters::bump(&self.counters.late_messages);
        debug!(worker_id = %worker, task_id = %task_id, "late reply dropped; caller no longer waiting");
    }

    fn release(&mut self, worker: WorkerId, task_id: TaskId) {
        match self.pool.release(worker, task_id) {
            Ok(Some((worker, task))) => self.dispatch(worker, task),
            Ok(None) => {}
            Err(e) => warn!(worker_id = %worker, task_id = %task_id, error = %e, "unexpected reply ignored"),
        }
    }

    fn on_exit(&mut self, worker: WorkerId, exit_code: Option<i32>) {
        self.retire(worker, exit_code, DispatchError::WorkerCrashed { worker, exit_code });
    }

    /// Mark a unit crashed, reject its in-flight task with `error` and
    /// schedule a replacement.
    fn retire(&mut self, worker: WorkerId, exit_code: Option<i32>, error: DispatchError) {
        let Some(report) = self.pool.crash(worker, exit_code) else {
            debug!(worker_id = %worker, "exit of untracked worker ignored");
            return;
        };
        DispatchCounters::bump(&self.counters.worker_crashes);
        if let Some(task_id) = report.in_flight {
            let counter = match error {
                DispatchError::WorkerCrashed { .. } => &self.counters.crashed,
                _ => &self.counters.failed,
            };
            if self.registry.reject(task_id, error) {
                DispatchCounters::bump(counter);
            }
        }
        self.respawn(0);
    }

    fn respawn(&mut self, attempt: u32) {
        let worker = self.pool.allocate_id();
        let delay = self.config.respawn_delay(attempt);
        let factory = Arc::clone(&self.factory);
        let events = self.events_tx.clone();
        let spawned = self.spawned_tx.clone();
        debug!(worker_id = %worker, attempt, delay = ?delay, "spawning replacement worker");

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = factory.spawn(worker, events).await;
            let _ = spawned.send(Spawned {
                worker,
                attempt,
                result,
            });
        });
    }

    fn handle_spawned(&mut self, spawned: Spawned<F::Unit>) {
        match spawned.result {
            Ok(unit) => match self.pool.install(unit) {
                Ok(next) => {
                    info!(worker_id = %spawned.worker, "replacement worker ready");
                    if let Some((worker, task)) = next {
                        self.dispatch(worker, task);
                    }
                }
                Err(unit) => {
                    warn!(worker_id = %spawned.worker, "no room for replacement worker; stopping it");
                    tokio::spawn(unit.stop(self.config.worker_grace()));
                }
            },
            Err(e) => {
                error!(
                    worker_id = %spawned.worker,
                    attempt = spawned.attempt,
                    error = %e,
                    "replacement worker failed to start; retrying"
                );
                self.respawn(spawned.attempt.saturating_add(1));
            }
        }
    }

    fn cancel(&mut self, task_id: TaskId, force: bool) -> bool {
        let Some(state) = self.registry.state(task_id) else {
            return false;
        };
        self.registry.reject(task_id, DispatchError::Cancelled);
        DispatchCounters::bump(&self.counters.cancelled);

        if state == TaskState::Dispatched && force {
            if let Some(worker) = self.pool.worker_for(task_id) {
                if self.pool.force_replace(worker).is_some() {
                    info!(worker_id = %worker, task_id = %task_id, "worker killed to cancel task");
                    self.respawn(0);
                }
            }
        } else if self.pool.remove_waiter(task_id).is_some() {
            debug!(task_id = %task_id, "task cancelled before dispatch");
        } else {
            debug!(task_id = %task_id, "task cancelled; worker result will be discarded");
        }
        true
    }

    fn expire_overdue(&mut self) {
        for task_id in self.registry.expire(Instant::now()) {
            DispatchCounters::bump(&self.counters.timed_out);
            if self.pool.remove_waiter(task_id).is_some() {
                debug!(task_id = %task_id, "task timed out while queued");
            } else {
                debug!(task_id = %task_id, "task timed out; worker keeps running");
            }
        }
    }

    fn publish(&self) {
        *self.snapshot.write() = PoolSnapshot {
            pool_size: self.pool.capacity(),
            idle: self.pool.idle_count(),
            busy: self.pool.busy_count(),
            crashed: self.pool.crashed_count(),
            queued: self.pool.waiter_count(),
            in_flight: self.registry.len(),
        };
    }

    async fn shutdown(mut self) {
        let rejected = self.registry.reject_all(&DispatchError::Shutdown);
        let dropped = self.pool.drain_waiters().len();
        let units = self.pool.begin_shutdown();
        info!(
            workers = units.len(),
            rejected, dropped, "dispatcher shutting down"
        );
        stop_all::<_, P>(units, self.config.worker_grace()).await;
        self.publish();
        info!("dispatcher shut down complete");
    }
}
