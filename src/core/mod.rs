//! Core dispatching abstractions: tasks, worker units, the pool, the
//! registry and the coordinator that ties them together.

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod stats;
pub mod task;
pub mod worker;

pub use dispatcher::{Dispatcher, TaskHandle};
pub use error::{AppResult, DispatchError};
pub use executor::{FnExecutor, WorkerExecutor};
pub use pool::{Acquire, CrashReport, WorkerHandle, WorkerPool, WorkerState};
pub use protocol::{WorkerEvent, WorkerMessage, WorkerRequest};
pub use registry::{Continuation, Outcome, PendingEntry, TaskRegistry};
pub use stats::DispatcherStats;
pub use task::{Task, TaskFailure, TaskId, TaskMeta, TaskState, WorkerId};
pub use worker::{
    serve_stdio, EventReceiver, EventSender, ProcessWorker, ProcessWorkerFactory, ThreadWorker,
    ThreadWorkerFactory, WorkerFactory, WorkerUnit, PANIC_EXIT_CODE,
};
