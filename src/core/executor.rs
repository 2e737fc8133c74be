//! Task function abstraction run inside a worker unit.

use async_trait::async_trait;

use super::task::{TaskFailure, TaskMeta};

/// The CPU-bound work a worker unit performs for each task.
///
/// Results do not need to be serializable for thread workers; process
/// workers additionally require `serde` bounds on `P` and `R`.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use offload_dispatcher::core::{TaskFailure, TaskMeta, WorkerExecutor};
///
/// #[derive(Clone)]
/// struct Fibonacci;
///
/// #[async_trait]
/// impl WorkerExecutor<u32, u64> for Fibonacci {
///     async fn execute(&self, n: u32, _meta: TaskMeta) -> Result<u64, TaskFailure> {
///         if n > 93 {
///             return Err(TaskFailure::new("n too large for u64"));
///         }
///         let (mut a, mut b) = (0_u64, 1_u64);
///         for _ in 0..n {
///             (a, b) = (b, a + b);
///         }
///         Ok(a)
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerExecutor<P, R>: Send + Sync + Clone + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Execute a task payload.
    ///
    /// # Threading
    ///
    /// Thread workers call this from a dedicated OS thread with its own
    /// single-threaded tokio runtime, so blocking here never stalls the
    /// coordinator.
    ///
    /// # Errors
    ///
    /// A `TaskFailure` is delivered to the caller as `DispatchError::Task`.
    async fn execute(&self, payload: P, meta: TaskMeta) -> Result<R, TaskFailure>;
}

/// Adapts a plain synchronous function into a `WorkerExecutor`.
#[derive(Clone)]
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F> {
    /// Wrap a function.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<P, R, F> WorkerExecutor<P, R> for FnExecutor<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P) -> Result<R, TaskFailure> + Send + Sync + Clone + 'static,
{
    async fn execute(&self, payload: P, _meta: TaskMeta) -> Result<R, TaskFailure> {
        (self.0)(payload)
    }
}
