//! Worker units: isolated execution contexts that run one task at a time.
//!
//! A unit is created by a [`WorkerFactory`], receives tasks through
//! [`WorkerUnit::send`], and reports back on the shared event channel handed
//! to it at spawn time. Two implementations ship with the crate:
//!
//! - [`ThreadWorkerFactory`]: a dedicated OS thread with its own
//!   single-threaded tokio runtime.
//! - [`ProcessWorkerFactory`]: a child process speaking JSON lines over
//!   stdin/stdout.

mod process;
mod thread;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::DispatchError;
use super::protocol::WorkerEvent;
use super::task::{Task, WorkerId};

pub use process::{serve_stdio, ProcessWorker, ProcessWorkerFactory};
pub use thread::{ThreadWorker, ThreadWorkerFactory, PANIC_EXIT_CODE};

/// Channel on which every unit reports its messages and exit.
pub type EventSender<R> = mpsc::UnboundedSender<(WorkerId, WorkerEvent<R>)>;

/// Receiving side of [`EventSender`].
pub type EventReceiver<R> = mpsc::UnboundedReceiver<(WorkerId, WorkerEvent<R>)>;

/// A running worker unit.
///
/// The pool only calls [`send`](Self::send) on a unit it considers idle.
/// After each task the unit emits exactly one `Result` or `Failure`
/// message, or terminates and emits `Exited`.
#[async_trait]
pub trait WorkerUnit<P>: Send + 'static {
    /// The unit's identity.
    fn id(&self) -> WorkerId;

    /// Deliver a task.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::WorkerUnavailable` if the unit no longer
    /// accepts work.
    fn send(&mut self, task: Task<P>) -> Result<(), DispatchError>;

    /// Terminate the unit immediately, abandoning any running task.
    fn kill(&mut self);

    /// Request graceful termination; force it once `grace` has elapsed.
    async fn stop(self, grace: Duration);
}

/// Creates worker units.
#[async_trait]
pub trait WorkerFactory<P, R>: Send + Sync + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// The unit type this factory produces.
    type Unit: WorkerUnit<P>;

    /// Start a unit and wait until it signals readiness.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Spawn` if the unit cannot be started or does
    /// not become ready in time.
    async fn spawn(&self, id: WorkerId, events: EventSender<R>) -> Result<Self::Unit, DispatchError>;
}
