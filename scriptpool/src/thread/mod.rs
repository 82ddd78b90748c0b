#![doc = " Dedicated-thread worker runtime: tasks, workers, the pool and the scheduler in front of it."]

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export key types for easier usage
pub use bridge::{Message, MessageBridge, MessageHandler};
pub use config::{RuntimeConfig, SchedulerConfig, ThreadPoolConfig, WorkerConfig};
pub use context::{Block, ContextScope, WorkerInterface};
pub use error::{ConfigError, ErrorKind, PoolError, TaskError, WorkerError};
pub use pool::{PoolMetrics, PoolObserver, ThreadPool};
pub use scheduler::{GroupSummary, TaskGroup, TaskScheduler, MEMBER_INDEX_PARAM};
pub use task::{Completion, Task, TaskId, TaskPriority, TaskRef, TaskStatus};
pub use worker::{Worker, WorkerDelegate, WorkerId, WorkerStatus};
