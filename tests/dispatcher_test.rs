//! Integration tests for the Dispatcher with thread workers
//!
//! These tests validate end-to-end behavior including:
//! - Completion of tasks within pool capacity
//! - Waiter queue hand-off and saturation
//! - Timeouts with late worker replies
//! - Crash detection and worker replacement
//! - Cancellation and graceful shutdown
//! - Exactly-once outcomes under randomized load

use async_trait::async_trait;
use futures::future::join_all;
use offload_dispatcher::config::DispatcherConfig;
use offload_dispatcher::core::{
    DispatchError, Dispatcher, DispatcherStats, TaskFailure, TaskMeta, ThreadWorkerFactory,
    WorkerExecutor, PANIC_EXIT_CODE,
};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// TEST EXECUTOR
// ============================================================================

#[derive(Debug, Clone)]
enum Work {
    Echo(u64),
    /// Blocks the worker thread, like CPU-bound work would.
    Sleep(u64),
    Fail(&'static str),
    Panic,
}

#[derive(Clone, Default)]
struct TestExecutor {
    executed: Arc<AtomicU64>,
}

impl TestExecutor {
    fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerExecutor<Work, u64> for TestExecutor {
    async fn execute(&self, work: Work, _meta: TaskMeta) -> Result<u64, TaskFailure> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        match work {
            Work::Echo(value) => Ok(value),
            Work::Sleep(ms) => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(ms)
            }
            Work::Fail(message) => Err(TaskFailure::new(message)),
            Work::Panic => panic!("task blew up"),
        }
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn config(pool_size: usize, waiter_queue_cap: usize) -> DispatcherConfig {
    DispatcherConfig::new()
        .with_pool_size(pool_size)
        .with_waiter_queue_cap(waiter_queue_cap)
        .with_task_timeout_ms(5_000)
        .with_worker_grace_shutdown_ms(1_000)
        .with_respawn_backoff_ms(10, 100)
}

async fn start(pool_size: usize, waiter_queue_cap: usize) -> (Dispatcher<Work, u64>, TestExecutor) {
    let executor = TestExecutor::default();
    let config = config(pool_size, waiter_queue_cap);
    let factory = ThreadWorkerFactory::from_config(executor.clone(), &config);
    let dispatcher = Dispatcher::start(config, factory)
        .await
        .expect("dispatcher should start");
    (dispatcher, executor)
}

/// Poll stats until `pred` holds; the coordinator publishes asynchronously.
async fn wait_for_stats<F>(dispatcher: &Dispatcher<Work, u64>, pred: F) -> DispatcherStats
where
    F: Fn(&DispatcherStats) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = dispatcher.stats();
        if pred(&stats) {
            return stats;
        }
        assert!(Instant::now() < deadline, "stats never matched: {stats:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_tasks_within_pool_size_all_complete() {
    println!("\n=== test_tasks_within_pool_size_all_complete ===");
    let (dispatcher, executor) = start(4, 0).await;

    let handles: Vec<_> = (0..4).map(|i| dispatcher.submit(Work::Echo(i))).collect();
    let results = join_all(handles).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result, Ok(i as u64));
    }
    assert_eq!(executor.executed(), 4);

    let stats = wait_for_stats(&dispatcher, |s| s.idle_workers == 4).await;
    assert_eq!(stats.submitted, 4);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.saturated, 0);
    assert_eq!(stats.in_flight_tasks, 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_saturation_rejects_only_excess() {
    println!("\n=== test_saturation_rejects_only_excess ===");
    let (dispatcher, _executor) = start(2, 1).await;

    let handles: Vec<_> = (0..4).map(|_| dispatcher.submit(Work::Sleep(150))).collect();
    let mut handles = handles.into_iter();
    let running = [handles.next().unwrap(), handles.next().unwrap()];
    let queued = handles.next().unwrap();
    let rejected = handles.next().unwrap();

    // Rejection is immediate, not after a running task finishes.
    let outcome = tokio::time::timeout(Duration::from_millis(100), rejected)
        .await
        .expect("saturation should be reported immediately");
    assert_eq!(outcome, Err(DispatchError::PoolSaturated));

    for result in join_all(running).await {
        assert_eq!(result, Ok(150));
    }
    assert_eq!(queued.await, Ok(150));

    let stats = dispatcher.stats();
    assert_eq!(stats.saturated, 1);
    assert_eq!(stats.completed, 3);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_zero_waiter_cap_rejects_when_busy() {
    let (dispatcher, _executor) = start(1, 0).await;

    let first = dispatcher.submit(Work::Sleep(100));
    let second = dispatcher.submit(Work::Echo(1));

    assert_eq!(second.await, Err(DispatchError::PoolSaturated));
    assert_eq!(first.await, Ok(100));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_queued_task_runs_when_worker_frees() {
    println!("\n=== test_queued_task_runs_when_worker_frees ===");
    let (dispatcher, _executor) = start(2, 1).await;

    let started = Instant::now();
    let handles: Vec<_> = (0..3).map(|_| dispatcher.submit(Work::Sleep(100))).collect();
    let results = join_all(handles).await;
    let elapsed = started.elapsed();

    assert!(results.iter().all(|r| *r == Ok(100)));
    // The third task waits for one of the first two.
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    println!("three 100ms tasks on two workers took {elapsed:?}");

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_timeout_then_late_result_is_dropped() {
    println!("\n=== test_timeout_then_late_result_is_dropped ===");
    let (dispatcher, _executor) = start(1, 0).await;

    let started = Instant::now();
    let outcome = dispatcher
        .submit_with_timeout(Work::Sleep(300), Duration::from_millis(50))
        .await;
    assert_eq!(outcome, Err(DispatchError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(250));

    // The worker finishes later; its reply has no caller and frees the worker.
    let stats = wait_for_stats(&dispatcher, |s| s.late_messages == 1 && s.idle_workers == 1).await;
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.worker_crashes, 0);

    assert_eq!(dispatcher.submit(Work::Echo(9)).await, Ok(9));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_task_does_not_block_queue() {
    let (dispatcher, _executor) = start(1, 1).await;

    let slow = dispatcher.submit_with_timeout(Work::Sleep(300), Duration::from_millis(100));
    let next = dispatcher.submit_with_timeout(Work::Echo(7), Duration::from_secs(3));

    assert_eq!(slow.await, Err(DispatchError::Timeout));
    assert_eq!(next.await, Ok(7));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_task_submitted_after_timeout_is_served() {
    println!("\n=== test_task_submitted_after_timeout_is_served ===");
    let (dispatcher, _executor) = start(1, 1).await;

    let slow = dispatcher.submit_with_timeout(Work::Sleep(200), Duration::from_millis(50));
    assert_eq!(slow.await, Err(DispatchError::Timeout));

    // The worker is still finishing the timed-out task; the new one waits for it.
    let submitted = Instant::now();
    let next = dispatcher.submit_with_timeout(Work::Echo(9), Duration::from_secs(2));
    assert_eq!(next.await, Ok(9));
    assert!(submitted.elapsed() < Duration::from_secs(1));

    let stats = wait_for_stats(&dispatcher, |s| s.idle_workers == 1).await;
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.worker_crashes, 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_queued_task_can_time_out() {
    let (dispatcher, executor) = start(1, 1).await;

    let running = dispatcher.submit(Work::Sleep(200));
    let queued = dispatcher.submit_with_timeout(Work::Echo(1), Duration::from_millis(50));

    assert_eq!(queued.await, Err(DispatchError::Timeout));
    assert_eq!(running.await, Ok(200));
    wait_for_stats(&dispatcher, |s| s.idle_workers == 1).await;

    // The expired task was removed from the queue and never ran.
    assert_eq!(executor.executed(), 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_task_failure_keeps_worker() {
    let (dispatcher, _executor) = start(1, 0).await;

    let outcome = dispatcher.submit(Work::Fail("bad input")).await;
    assert_eq!(outcome, Err(DispatchError::Task(TaskFailure::new("bad input"))));

    assert_eq!(dispatcher.submit(Work::Echo(3)).await, Ok(3));
    let stats = dispatcher.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.worker_crashes, 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    println!("\n=== test_crashed_worker_is_replaced ===");
    let (dispatcher, _executor) = start(2, 4).await;

    let crash = dispatcher.submit(Work::Panic);
    let others: Vec<_> = (0..3).map(|i| dispatcher.submit(Work::Echo(i))).collect();

    match crash.await {
        Err(DispatchError::WorkerCrashed { exit_code, .. }) => {
            assert_eq!(exit_code, Some(PANIC_EXIT_CODE));
        }
        other => panic!("expected WorkerCrashed, got {other:?}"),
    }
    // Other tasks are unaffected by the crash.
    for (i, result) in join_all(others).await.into_iter().enumerate() {
        assert_eq!(result, Ok(i as u64));
    }

    let stats = wait_for_stats(&dispatcher, |s| s.idle_workers == 2).await;
    assert_eq!(stats.crashed_workers, 0);
    assert_eq!(stats.worker_crashes, 1);
    assert_eq!(stats.crashed, 1);

    let after: Vec<_> = (10..12).map(|i| dispatcher.submit(Work::Echo(i))).collect();
    assert_eq!(join_all(after).await, vec![Ok(10), Ok(11)]);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_task() {
    let (dispatcher, executor) = start(1, 2).await;

    let running = dispatcher.submit(Work::Sleep(150));
    let queued = dispatcher.submit(Work::Echo(5));
    let queued_id = queued.id();

    assert!(dispatcher.cancel(queued_id).await);
    assert_eq!(queued.await, Err(DispatchError::Cancelled));
    assert!(!dispatcher.cancel(queued_id).await);

    assert_eq!(running.await, Ok(150));
    wait_for_stats(&dispatcher, |s| s.idle_workers == 1).await;
    assert_eq!(executor.executed(), 1);
    assert_eq!(dispatcher.stats().cancelled, 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_task_discards_result() {
    let (dispatcher, _executor) = start(1, 0).await;

    let running = dispatcher.submit(Work::Sleep(100));
    assert!(dispatcher.cancel(running.id()).await);
    assert_eq!(running.await, Err(DispatchError::Cancelled));

    let stats = wait_for_stats(&dispatcher, |s| s.late_messages == 1).await;
    assert_eq!(stats.idle_workers, 1);
    assert_eq!(stats.worker_crashes, 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_force_cancel_replaces_worker() {
    println!("\n=== test_force_cancel_replaces_worker ===");
    let (dispatcher, _executor) = start(1, 0).await;

    let stuck = dispatcher.submit(Work::Sleep(2_000));
    // Let the task reach the worker.
    wait_for_stats(&dispatcher, |s| s.busy_workers == 1).await;

    let started = Instant::now();
    assert!(dispatcher.force_cancel(stuck.id()).await);
    assert_eq!(stuck.await, Err(DispatchError::Cancelled));

    // A fresh worker serves the next task long before the stuck one ends.
    let stats = wait_for_stats(&dispatcher, |s| s.idle_workers == 1).await;
    assert_eq!(stats.busy_workers, 0);
    assert_eq!(dispatcher.submit(Work::Echo(4)).await, Ok(4));
    assert!(started.elapsed() < Duration::from_millis(1_500));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_pending_tasks() {
    println!("\n=== test_shutdown_rejects_pending_tasks ===");
    let (dispatcher, _executor) = start(1, 4).await;

    let running = dispatcher.submit(Work::Sleep(200));
    let queued = dispatcher.submit(Work::Echo(1));
    wait_for_stats(&dispatcher, |s| s.queued_tasks == 1).await;

    dispatcher.shutdown().await;

    assert_eq!(running.await, Err(DispatchError::Shutdown));
    assert_eq!(queued.await, Err(DispatchError::Shutdown));
    assert!(!dispatcher.is_running());
    assert_eq!(dispatcher.submit(Work::Echo(2)).await, Err(DispatchError::Shutdown));
    assert!(!dispatcher.cancel(offload_dispatcher::core::TaskId::new()).await);

    // A second shutdown is a no-op.
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_dropping_last_handle_shuts_down() {
    let (dispatcher, _executor) = start(1, 0).await;

    let pending = dispatcher.submit(Work::Sleep(200));
    drop(dispatcher);

    assert_eq!(pending.await, Err(DispatchError::Shutdown));
}

#[tokio::test]
async fn test_clones_share_one_pool() {
    let (dispatcher, _executor) = start(1, 0).await;
    let other = dispatcher.clone();

    let first = dispatcher.submit(Work::Sleep(100));
    let second = other.submit(Work::Echo(1));

    assert_eq!(second.await, Err(DispatchError::PoolSaturated));
    assert_eq!(first.await, Ok(100));
    assert_eq!(other.stats().submitted, 2);

    other.shutdown().await;
    assert!(!dispatcher.is_running());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let executor = TestExecutor::default();
    let config = DispatcherConfig::new().with_pool_size(0);
    let factory = ThreadWorkerFactory::new(executor);

    let result = Dispatcher::<Work, u64>::start(config, factory).await;
    assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_random_load_settles_each_task_once() {
    println!("\n=== test_random_load_settles_each_task_once ===");
    let (dispatcher, executor) = start(3, 64).await;

    // (sleep ms, timeout ms)
    let plan: Vec<(u64, u64)> = {
        let mut rng = rand::rng();
        (0..40)
            .map(|_| {
                let work = rng.random_range(0..30);
                let timeout = if rng.random_bool(0.25) { 5 } else { 5_000 };
                (work, timeout)
            })
            .collect()
    };

    let handles: Vec<_> = plan
        .iter()
        .map(|&(work, timeout)| {
            dispatcher.submit_with_timeout(Work::Sleep(work), Duration::from_millis(timeout))
        })
        .collect();
    let ids: HashSet<_> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(ids.len(), plan.len());

    let results = join_all(handles).await;
    let mut ok = 0;
    let mut timed_out = 0;
    for ((work, timeout), result) in plan.iter().zip(results) {
        match result {
            Ok(value) => {
                assert_eq!(value, *work);
                ok += 1;
            }
            Err(DispatchError::Timeout) => {
                assert_eq!(*timeout, 5, "only short-timeout tasks may time out");
                timed_out += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok + timed_out, plan.len() as u64);

    let stats = wait_for_stats(&dispatcher, |s| s.idle_workers == 3).await;
    assert_eq!(stats.submitted, plan.len() as u64);
    assert_eq!(stats.completed, ok);
    assert_eq!(stats.timed_out, timed_out);
    assert_eq!(stats.in_flight_tasks, 0);
    assert_eq!(stats.queued_tasks, 0);
    // Every task that started produced exactly one reply.
    assert_eq!(executor.executed(), stats.completed + stats.late_messages);

    dispatcher.shutdown().await;
}
