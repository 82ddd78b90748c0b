use std::time::Duration;

use thiserror::Error;

use scriptpool_api::{ProviderError, ScriptError};

use crate::thread::task::TaskStatus;
use crate::thread::worker::{WorkerId, WorkerStatus};

/// Coarse error classification shared by [`TaskError::kind`] and
/// [`WorkerError::kind`]. Context failures only ever surface on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    ContextCreation,
    ApiRegistration,
    Script,
    Timeout,
    Cancelled,
    PrepareFailed,
}

/// Errors resolved into a single task's terminal status.
///
/// These never escape a worker thread as faults; they reach the caller
/// through the task's error callback or `Task::error()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Cannot {operation} a task in {status} status")]
    InvalidState {
        operation: &'static str,
        status: TaskStatus,
    },
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),
    #[error("Task was cancelled")]
    Cancelled,
    #[error("Task preparation failed: {0}")]
    PrepareFailed(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TaskError::InvalidState { .. } => ErrorKind::InvalidState,
            TaskError::Script(_) => ErrorKind::Script,
            TaskError::Timeout(_) => ErrorKind::Timeout,
            TaskError::Cancelled => ErrorKind::Cancelled,
            TaskError::PrepareFailed(_) => ErrorKind::PrepareFailed,
        }
    }
}

/// Errors related to a single worker thread.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error("Execution context setup failed: {0}")]
    Context(#[from] ProviderError),
    #[error("Worker {worker} cannot accept work in {status} status")]
    NotAccepting {
        worker: WorkerId,
        status: WorkerStatus,
    },
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(String),
    #[error("Timed out waiting for worker {0} to stop")]
    JoinTimeout(WorkerId),
    #[error("Worker thread panicked: {0}")]
    Panicked(String),
    #[error("Worker has been dropped")]
    Detached,
}

impl WorkerError {
    /// Taxonomy kind for context failures; `None` for thread-level errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            WorkerError::Context(ProviderError::ApiRegistration { .. }) => {
                Some(ErrorKind::ApiRegistration)
            }
            WorkerError::Context(_) => Some(ErrorKind::ContextCreation),
            _ => None,
        }
    }
}

/// Errors related to the thread pool and scheduler.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Thread pool is shutting down")]
    ShuttingDown,
    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("Failed during shutdown: {0}")]
    ShutdownError(String),
    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Internal pool error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised while validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
