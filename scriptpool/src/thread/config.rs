use std::time::Duration;

use crate::thread::error::ConfigError;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_POOL_SIZE: usize = 64;

// --- Pool Configuration ---

/// Configuration for the `ThreadPool`.
#[derive(Clone, Debug)]
pub struct ThreadPoolConfig {
    /// Number of workers started by `ThreadPool::new`.
    pub initial_size: usize,

    /// Upper bound applied by `adjust_pool_size`.
    pub max_size: usize,

    /// Timeout applied to tasks that do not set their own. `None` disables
    /// the watchdog for such tasks.
    pub default_task_timeout: Option<Duration>,

    /// Prefix for worker thread names; the worker id is appended.
    pub thread_name_prefix: String,

    /// How long `shutdown` waits for each worker thread to exit.
    pub shutdown_timeout: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: num_cpus::get().min(DEFAULT_MAX_POOL_SIZE),
            max_size: DEFAULT_MAX_POOL_SIZE,
            default_task_timeout: Some(DEFAULT_TASK_TIMEOUT),
            thread_name_prefix: "script-worker-".to_string(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ThreadPoolConfig {
    /// Settings handed to each worker.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            thread_name_prefix: self.thread_name_prefix.clone(),
            default_task_timeout: self.default_task_timeout,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.initial_size > self.max_size {
            return Err(ConfigError::Invalid {
                field: "initial_size",
                reason: format!("{} exceeds max_size {}", self.initial_size, self.max_size),
            });
        }
        if self.default_task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid {
                field: "default_task_timeout",
                reason: "must be non-zero; use None to disable".to_string(),
            });
        }
        Ok(())
    }
}

// --- Worker Configuration ---

/// Per-worker settings derived from the pool configuration.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub thread_name_prefix: String,
    pub default_task_timeout: Option<Duration>,
}

impl WorkerConfig {
    /// Resolve the watchdog timeout for a task, letting the task's own
    /// setting override the pool default.
    pub fn effective_timeout(&self, task_timeout: Option<Duration>) -> Option<Duration> {
        task_timeout.or(self.default_task_timeout)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        ThreadPoolConfig::default().worker_config()
    }
}

// --- Scheduler Configuration ---

/// Configuration for the `TaskScheduler`.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Interval of the periodic `balance_load` pass.
    pub balance_interval: Duration,

    /// How long a queued task may wait before it is promoted one priority
    /// tier. `None` disables promotion.
    pub promotion_bound: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            balance_interval: Duration::from_millis(100),
            promotion_bound: Some(Duration::from_secs(5)),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.balance_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "balance_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.promotion_bound == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid {
                field: "promotion_bound",
                reason: "must be non-zero; use None to disable".to_string(),
            });
        }
        Ok(())
    }
}

// --- Runtime Configuration ---

/// Combined configuration for a pool and the scheduler in front of it.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    pub pool: ThreadPoolConfig,
    pub scheduler: SchedulerConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.scheduler.validate()
    }
}
