//! # Offload Dispatcher
//!
//! Offloads CPU-bound work to a fixed-size pool of isolated worker units and
//! hands each caller an awaitable that settles exactly once.
//!
//! The coordinating runtime must stay responsive while expensive jobs run.
//! This crate keeps that work off the caller's runtime by sending every task
//! to a dedicated unit, either an OS thread with its own single-threaded
//! runtime or a child process speaking JSON lines, and routing the reply back
//! to whoever submitted it.
//!
//! ## Key Features
//!
//! - **Bounded Pool**: `pool_size` units, each running at most one task
//! - **Waiter Queue**: FIFO backlog with a configurable cap; beyond it
//!   submissions fail fast with `PoolSaturated`
//! - **Exactly-Once Outcomes**: result, failure, timeout, crash, cancellation
//!   and shutdown all race for one pending entry; the first one wins
//! - **Crash Recovery**: a unit that dies is replaced with exponential
//!   backoff while the rest of the pool keeps serving
//! - **Two Unit Kinds**: [`core::ThreadWorkerFactory`] and
//!   [`core::ProcessWorkerFactory`] behind one [`core::WorkerFactory`] trait
//!
//! ```rust,ignore
//! use offload_dispatcher::config::DispatcherConfig;
//! use offload_dispatcher::core::{Dispatcher, DispatchError, FnExecutor, ThreadWorkerFactory};
//! use std::time::Duration;
//!
//! let config = DispatcherConfig::from_env()?;
//! let executor = FnExecutor::new(|n: u64| Ok((1..=n).sum::<u64>()));
//! let dispatcher = Dispatcher::start(config.clone(), ThreadWorkerFactory::from_config(executor, &config)).await?;
//!
//! match dispatcher.submit_with_timeout(1_000_000, Duration::from_secs(2)).await {
//!     Ok(sum) => println!("sum = {sum}"),
//!     Err(DispatchError::PoolSaturated) => println!("busy, try later"),
//!     Err(e) => println!("failed: {e}"),
//! }
//!
//! dispatcher.shutdown().await;
//! ```
//!
//! For complete scenarios, see:
//! - `tests/dispatcher_test.rs` - Thread worker integration tests
//! - `tests/process_worker_test.rs` - Child process workers via `offload-worker`

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Configuration models for the dispatcher and its workers.
pub mod config;
/// Core dispatching abstractions, worker units and the coordinator.
pub mod core;
/// Request/response models for exposing the dispatcher over an API.
pub mod runtime;
/// Shared utilities.
pub mod util;
