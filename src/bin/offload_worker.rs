//! `offload-worker`: reference child process for `ProcessWorkerFactory`.
//!
//! Speaks the JSON-lines worker protocol on stdin/stdout and logs to stderr.
//! Payloads are tagged jobs, e.g. `{"job":"fibonacci","n":40}`; every job
//! produces a `u64`.
//!
//! - `fibonacci { n }`: the n-th Fibonacci number, failing on overflow
//! - `sum { upto }`: `1 + 2 + ... + upto`, failing on overflow
//! - `sleep { ms }`: blocks the process for `ms` milliseconds, returns `ms`
//! - `fail { message }`: fails the task with `message`
//! - `exit { code }`: terminates the process immediately with `code`

use std::time::Duration;

use async_trait::async_trait;
use offload_dispatcher::core::{serve_stdio, AppResult, TaskFailure, TaskMeta, WorkerExecutor};
use offload_dispatcher::util::init_tracing;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
enum Job {
    Fibonacci { n: u32 },
    Sum { upto: u64 },
    Sleep { ms: u64 },
    Fail { message: String },
    Exit { code: i32 },
}

#[derive(Clone)]
struct JobRunner;

#[async_trait]
impl WorkerExecutor<Job, u64> for JobRunner {
    async fn execute(&self, job: Job, meta: TaskMeta) -> Result<u64, TaskFailure> {
        debug!(task_id = %meta.id, job = ?job, "running job");
        match job {
            Job::Fibonacci { n } => fibonacci(n),
            Job::Sum { upto } => sum(upto),
            Job::Sleep { ms } => {
                // Deliberately blocking: the process is the unit of isolation.
                std::thread::sleep(Duration::from_millis(ms));
                Ok(ms)
            }
            Job::Fail { message } => Err(TaskFailure::new(message)),
            Job::Exit { code } => std::process::exit(code),
        }
    }
}

fn fibonacci(n: u32) -> Result<u64, TaskFailure> {
    let overflow = || TaskFailure::new(format!("fibonacci({n}) overflows u64"));
    let (mut a, mut b) = (0_u128, 1_u128);
    for _ in 0..n {
        let next = a.checked_add(b).ok_or_else(overflow)?;
        (a, b) = (b, next);
    }
    u64::try_from(a).map_err(|_| overflow())
}

fn sum(upto: u64) -> Result<u64, TaskFailure> {
    (1..=upto)
        .try_fold(0_u64, u64::checked_add)
        .ok_or_else(|| TaskFailure::new(format!("sum to {upto} overflows u64")))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> AppResult<()> {
    init_tracing();
    info!(pid = std::process::id(), "offload worker starting");
    serve_stdio::<Job, u64, _>(JobRunner).await?;
    info!("stdin closed; offload worker exiting");
    Ok(())
}
