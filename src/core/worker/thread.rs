//! Worker units backed by dedicated OS threads.
//!
//! Each thread owns a single-threaded tokio runtime and blocks on a
//! crossbeam channel between tasks, so CPU-bound executor work never runs on
//! the coordinator's runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{EventSender, WorkerFactory, WorkerUnit};
use crate::config::DispatcherConfig;
use crate::core::error::DispatchError;
use crate::core::executor::WorkerExecutor;
use crate::core::protocol::{WorkerEvent, WorkerMessage};
use crate::core::task::{Task, WorkerId};

/// Exit code reported when the task function panics.
pub const PANIC_EXIT_CODE: i32 = 101;

/// How often `stop` checks whether the thread has finished.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Spawns [`ThreadWorker`]s running a shared executor.
#[derive(Clone)]
pub struct ThreadWorkerFactory<E> {
    executor: E,
    stack_size: usize,
    spawn_timeout: Duration,
}

impl<E> ThreadWorkerFactory<E> {
    /// Factory with default stack size and spawn timeout.
    pub fn new(executor: E) -> Self {
        Self::from_config(executor, &DispatcherConfig::default())
    }

    /// Factory using the stack size and spawn timeout from `config`.
    pub fn from_config(executor: E, config: &DispatcherConfig) -> Self {
        Self {
            executor,
            stack_size: config.thread_stack_size,
            spawn_timeout: config.worker_spawn_timeout(),
        }
    }

    /// Set the worker thread stack size in bytes.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set how long to wait for a new thread to report ready.
    #[must_use]
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }
}

/// A worker unit running on its own OS thread.
///
/// Threads cannot be interrupted: [`kill`](WorkerUnit::kill) detaches the
/// thread and discards whatever it produces afterwards. A detached thread
/// keeps its OS thread until the running task returns, so after kills or
/// timed-out stops the process can hold more live threads than the pool
/// size. [`stop`](WorkerUnit::stop) never blocks a runtime thread on a
/// wedged worker.
pub struct ThreadWorker<P> {
    id: WorkerId,
    task_tx: Option<Sender<Task<P>>>,
    abandoned: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

#[async_trait]
impl<P, R, E> WorkerFactory<P, R> for ThreadWorkerFactory<E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    type Unit = ThreadWorker<P>;

    async fn spawn(&self, id: WorkerId, events: EventSender<R>) -> Result<ThreadWorker<P>, DispatchError> {
        let (task_tx, task_rx) = bounded::<Task<P>>(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let abandoned = Arc::new(AtomicBool::new(false));

        let executor = self.executor.clone();
        let flag = Arc::clone(&abandoned);
        let join = thread::Builder::new()
            .name(format!("offload-worker-{}", id.0))
            .stack_size(self.stack_size)
            .spawn(move || run_worker(id, &task_rx, &events, &executor, &flag, ready_tx))
            .map_err(|e| DispatchError::Spawn(format!("thread for {id}: {e}")))?;

        match tokio::time::timeout(self.spawn_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(worker_id = %id, "thread worker ready");
                Ok(ThreadWorker {
                    id,
                    task_tx: Some(task_tx),
                    abandoned,
                    join: Some(join),
                })
            }
            Ok(Ok(Err(reason))) => Err(DispatchError::Spawn(reason)),
            Ok(Err(_)) => Err(DispatchError::Spawn(format!("{id} exited before becoming ready"))),
            Err(_) => {
                abandoned.store(true, Ordering::Release);
                Err(DispatchError::Spawn(format!("{id} did not become ready in time")))
            }
        }
    }
}

#[async_trait]
impl<P: Send + 'static> WorkerUnit<P> for ThreadWorker<P> {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn send(&mut self, task: Task<P>) -> Result<(), DispatchError> {
        let Some(task_tx) = self.task_tx.as_ref() else {
            return Err(DispatchError::WorkerUnavailable(self.id));
        };
        task_tx
            .try_send(task)
            .map_err(|_| DispatchError::WorkerUnavailable(self.id))
    }

    fn kill(&mut self) {
        self.abandoned.store(true, Ordering::Release);
        self.task_tx = None;
        if self.join.take().is_some() {
            warn!(worker_id = %self.id, "thread worker detached; its running task is abandoned");
        }
    }

    async fn stop(mut self, grace: Duration) {
        // Closing the channel ends the worker loop after its current task.
        self.task_tx = None;
        let Some(join) = self.join.take() else {
            return;
        };
        let id = self.id;
        let deadline = Instant::now() + grace;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                self.abandoned.store(true, Ordering::Release);
                warn!(worker_id = %id, "worker did not exit within grace period - detaching");
                return;
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
        match join.join() {
            Ok(()) => debug!(worker_id = %id, "worker joined"),
            Err(_) => warn!(worker_id = %id, "worker panicked"),
        }
    }
}

/// Reports the thread's exit, whether it returns or unwinds.
struct ExitGuard<'a, R> {
    id: WorkerId,
    events: &'a EventSender<R>,
}

impl<R> Drop for ExitGuard<'_, R> {
    fn drop(&mut self) {
        let code = if thread::panicking() { PANIC_EXIT_CODE } else { 0 };
        let _ = self.events.send((self.id, WorkerEvent::Exited { code: Some(code) }));
    }
}

fn run_worker<P, R, E>(
    id: WorkerId,
    task_rx: &Receiver<Task<P>>,
    events: &EventSender<R>,
    executor: &E,
    abandoned: &AtomicBool,
    ready_tx: oneshot::Sender<Result<(), String>>,
) where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    let _exit = ExitGuard { id, events };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker_id = %id, error = %e, "failed to create worker runtime");
            let _ = ready_tx.send(Err(format!("runtime for {id}: {e}")));
            return;
        }
    };
    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    // Blocks until a task arrives; returns Err once the sender is dropped.
    while let Ok(task) = task_rx.recv() {
        let task_id = task.id();
        debug!(worker_id = %id, task_id = %task_id, "worker executing task");

        let outcome = rt.block_on(executor.execute(task.payload, task.meta));

        if abandoned.load(Ordering::Acquire) {
            debug!(worker_id = %id, task_id = %task_id, "worker abandoned, discarding outcome");
            break;
        }
        let message = match outcome {
            Ok(value) => WorkerMessage::Result { id: task_id, value },
            Err(error) => WorkerMessage::Failure { id: task_id, error },
        };
        if events.send((id, WorkerEvent::Message(message))).is_err() {
            break;
        }
    }
    debug!(worker_id = %id, "worker thread exiting");
}
