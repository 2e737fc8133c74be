//! Dispatcher configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable prefix used by [`DispatcherConfig::from_env`].
pub const ENV_PREFIX: &str = "OFFLOAD_";

/// Smallest accepted worker thread stack.
pub const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Configuration for a dispatcher and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker units (fixed for the pool's lifetime).
    pub pool_size: usize,
    /// Callers allowed to wait for a worker once all are busy. 0 = fail fast.
    pub waiter_queue_cap: usize,
    /// Default per-task timeout in milliseconds.
    pub task_timeout_ms: u64,
    /// Grace period for a worker to exit after a stop request.
    pub worker_grace_shutdown_ms: u64,
    /// How long a new worker may take to report ready.
    pub worker_spawn_timeout_ms: u64,
    /// Initial delay between failed replacement spawns.
    pub respawn_backoff_ms: u64,
    /// Upper bound for the replacement backoff.
    pub max_respawn_backoff_ms: u64,
    /// Stack size for thread workers in bytes.
    pub thread_stack_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            waiter_queue_cap: 0,
            task_timeout_ms: 30_000,
            worker_grace_shutdown_ms: 2_000,
            worker_spawn_timeout_ms: 5_000,
            respawn_backoff_ms: 100,
            max_respawn_backoff_ms: 5_000,
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl DispatcherConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker units.
    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Size the pool to the number of logical CPUs.
    #[must_use]
    pub fn with_cpu_pool_size(self) -> Self {
        self.with_pool_size(num_cpus::get())
    }

    /// Set how many callers may queue for a busy pool.
    #[must_use]
    pub const fn with_waiter_queue_cap(mut self, cap: usize) -> Self {
        self.waiter_queue_cap = cap;
        self
    }

    /// Set the default task timeout.
    #[must_use]
    pub const fn with_task_timeout_ms(mut self, ms: u64) -> Self {
        self.task_timeout_ms = ms;
        self
    }

    /// Set the worker shutdown grace period.
    #[must_use]
    pub const fn with_worker_grace_shutdown_ms(mut self, ms: u64) -> Self {
        self.worker_grace_shutdown_ms = ms;
        self
    }

    /// Set the worker readiness timeout.
    #[must_use]
    pub const fn with_worker_spawn_timeout_ms(mut self, ms: u64) -> Self {
        self.worker_spawn_timeout_ms = ms;
        self
    }

    /// Set the replacement backoff bounds.
    #[must_use]
    pub const fn with_respawn_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.respawn_backoff_ms = initial;
        self.max_respawn_backoff_ms = max;
        self
    }

    /// Set the thread worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Default task timeout.
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Worker shutdown grace period.
    #[must_use]
    pub const fn worker_grace(&self) -> Duration {
        Duration::from_millis(self.worker_grace_shutdown_ms)
    }

    /// Worker readiness timeout.
    #[must_use]
    pub const fn worker_spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_spawn_timeout_ms)
    }

    /// Delay before replacement attempt number `attempt` (0-based).
    ///
    /// The first attempt is immediate; later ones double from
    /// `respawn_backoff_ms` up to `max_respawn_backoff_ms`.
    #[must_use]
    pub fn respawn_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let ms = self
            .respawn_backoff_ms
            .saturating_mul(factor)
            .min(self.max_respawn_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be greater than 0".into());
        }
        if self.task_timeout_ms == 0 {
            return Err("task_timeout_ms must be greater than 0".into());
        }
        if self.worker_spawn_timeout_ms == 0 {
            return Err("worker_spawn_timeout_ms must be greater than 0".into());
        }
        if self.respawn_backoff_ms == 0 {
            return Err("respawn_backoff_ms must be greater than 0".into());
        }
        if self.max_respawn_backoff_ms < self.respawn_backoff_ms {
            return Err("max_respawn_backoff_ms must be at least respawn_backoff_ms".into());
        }
        if self.thread_stack_size < MIN_THREAD_STACK_SIZE {
            return Err(format!(
                "thread_stack_size must be at least {MIN_THREAD_STACK_SIZE} bytes"
            ));
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `OFFLOAD_*` environment variables, reading a
    /// `.env` file first if present.
    ///
    /// `OFFLOAD_POOL_SIZE=auto` sizes the pool to the CPU count.
    ///
    /// # Errors
    ///
    /// Returns a description of the first unparsable or invalid value.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup using the
    /// `OFFLOAD_*` names.
    ///
    /// # Errors
    ///
    /// Returns a description of the first unparsable or invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut cfg = Self::default();

        if let Some(raw) = get("POOL_SIZE") {
            cfg.pool_size = if raw.trim().eq_ignore_ascii_case("auto") {
                num_cpus::get()
            } else {
                parse_value("POOL_SIZE", &raw)?
            };
        }
        if let Some(raw) = get("WAITER_QUEUE_CAP") {
            cfg.waiter_queue_cap = parse_value("WAITER_QUEUE_CAP", &raw)?;
        }
        if let Some(raw) = get("TASK_TIMEOUT_MS") {
            cfg.task_timeout_ms = parse_value("TASK_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("WORKER_GRACE_SHUTDOWN_MS") {
            cfg.worker_grace_shutdown_ms = parse_value("WORKER_GRACE_SHUTDOWN_MS", &raw)?;
        }
        if let Some(raw) = get("WORKER_SPAWN_TIMEOUT_MS") {
            cfg.worker_spawn_timeout_ms = parse_value("WORKER_SPAWN_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("RESPAWN_BACKOFF_MS") {
            cfg.respawn_backoff_ms = parse_value("RESPAWN_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = get("MAX_RESPAWN_BACKOFF_MS") {
            cfg.max_respawn_backoff_ms = parse_value("MAX_RESPAWN_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = get("THREAD_STACK_SIZE") {
            cfg.thread_stack_size = parse_value("THREAD_STACK_SIZE", &raw)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{name}={raw:?}: {e}"))
}
