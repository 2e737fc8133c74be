//! Benchmarks for the offload dispatcher.
//!
//! Benchmarks cover:
//! - Registry register/resolve and deadline expiry
//! - Pool acquire/release with waiter hand-off
//! - End-to-end round trips through thread workers

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use std::hint::black_box;
use std::time::Duration;

use async_trait::async_trait;
use offload_dispatcher::config::DispatcherConfig;
use offload_dispatcher::core::{
    Acquire, DispatchError, Dispatcher, FnExecutor, Task, TaskFailure, TaskId, TaskRegistry,
    ThreadWorkerFactory, WorkerId, WorkerPool, WorkerUnit,
};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::time::Instant;

// ============================================================================
// Bench Unit
// ============================================================================

/// Unit that accepts every task and never replies.
struct NullUnit(WorkerId);

#[async_trait]
impl WorkerUnit<u64> for NullUnit {
    fn id(&self) -> WorkerId {
        self.0
    }

    fn send(&mut self, task: Task<u64>) -> Result<(), DispatchError> {
        black_box(task);
        Ok(())
    }

    fn kill(&mut self) {}

    async fn stop(self, _grace: Duration) {}
}

fn add_one(n: u64) -> Result<u64, TaskFailure> {
    Ok(n + 1)
}

// ============================================================================
// Registry Benchmarks
// ============================================================================

fn bench_registry_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_register_resolve");

    for size in [100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut registry = TaskRegistry::new();
                let mut receivers = Vec::with_capacity(size as usize);
                let ids: Vec<TaskId> = (0..size).map(|_| TaskId::new()).collect();
                for id in &ids {
                    let (tx, rx) = oneshot::channel();
                    registry.register(*id, tx, None).unwrap();
                    receivers.push(rx);
                }
                for (value, id) in ids.into_iter().enumerate() {
                    registry.resolve(id, value);
                }
                black_box(receivers)
            });
        });
    }
    group.finish();
}

fn bench_registry_expire(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_expire");

    for size in [100_u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut registry = TaskRegistry::<u64>::new();
                let now = Instant::now();
                let mut receivers = Vec::with_capacity(size as usize);
                for i in 0..size {
                    let (tx, rx) = oneshot::channel();
                    registry
                        .register(TaskId::new(), tx, Some(now + Duration::from_micros(i)))
                        .unwrap();
                    receivers.push(rx);
                }
                let expired = registry.expire(now + Duration::from_micros(size / 2));
                black_box((expired, receivers))
            });
        });
    }
    group.finish();
}

// ============================================================================
// Pool Benchmarks
// ============================================================================

fn bench_pool_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_release");

    for workers in [1_usize, 4, 16] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| {
                let mut pool = WorkerPool::new(workers, 1_000);
                for _ in 0..workers {
                    let id = pool.allocate_id();
                    assert!(pool.install(NullUnit(id)).is_ok());
                }
                let mut running = Vec::new();
                for n in 0..1_000_u64 {
                    if let Acquire::Granted(worker, task) = pool.acquire(Task::new(n)) {
                        let task_id = task.id();
                        pool.send(worker, task).unwrap();
                        running.push((worker, task_id));
                    }
                }
                // Each release hands the worker straight to the next waiter.
                while let Some((worker, task_id)) = running.pop() {
                    if let Ok(Some((next, task))) = pool.release(worker, task_id) {
                        let next_id = task.id();
                        pool.send(next, task).unwrap();
                        running.push((next, next_id));
                    }
                }
                black_box(pool.idle_count())
            });
        });
    }
    group.finish();
}

// ============================================================================
// End-to-End Benchmarks
// ============================================================================

fn bench_dispatch_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch_round_trip");

    for workers in [1_usize, 4] {
        let config = DispatcherConfig::new()
            .with_pool_size(workers)
            .with_waiter_queue_cap(1_000);
        let factory = ThreadWorkerFactory::from_config(
            FnExecutor::new(add_one as fn(u64) -> Result<u64, TaskFailure>),
            &config,
        );
        let dispatcher: Dispatcher<u64, u64> =
            rt.block_on(Dispatcher::start(config, factory)).unwrap();

        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.to_async(&rt).iter(|| async {
                let handles: Vec<_> = (0..100).map(|n| dispatcher.submit(n)).collect();
                black_box(join_all(handles).await)
            });
        });

        rt.block_on(dispatcher.shutdown());
    }
    group.finish();
}

criterion_group!(registry_benches, bench_registry_resolve, bench_registry_expire);

criterion_group!(pool_benches, bench_pool_handoff);

criterion_group!(dispatch_benches, bench_dispatch_round_trip);

criterion_main!(registry_benches, pool_benches, dispatch_benches);
