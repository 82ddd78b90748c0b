// Integration tests for error types in scriptpool::thread::error

use std::time::Duration;

use scriptpool::thread::error::*;
use scriptpool::thread::task::TaskStatus;
use scriptpool::thread::worker::{WorkerId, WorkerStatus};
use scriptpool_api::{ProviderError, ScriptError};

#[test]
fn test_task_error_display() {
    assert_eq!(
        TaskError::InvalidArgument("script is empty".to_string()).to_string(),
        "Invalid argument: script is empty"
    );
    assert_eq!(
        TaskError::InvalidState { operation: "execute", status: TaskStatus::Pending }.to_string(),
        "Cannot execute a task in Pending status"
    );
    assert_eq!(
        TaskError::Script(ScriptError::new("x is not defined").at(2, 5)).to_string(),
        "Script error: x is not defined (line 2, column 5)"
    );
    assert_eq!(
        TaskError::Timeout(Duration::from_millis(50)).to_string(),
        "Task timed out after 50ms"
    );
    assert_eq!(TaskError::Cancelled.to_string(), "Task was cancelled");
}

#[test]
fn test_task_error_kinds() {
    assert_eq!(TaskError::Cancelled.kind(), ErrorKind::Cancelled);
    assert_eq!(TaskError::Timeout(Duration::ZERO).kind(), ErrorKind::Timeout);
    assert_eq!(
        TaskError::from(ScriptError::new("boom")).kind(),
        ErrorKind::Script
    );
    assert_eq!(
        TaskError::PrepareFailed("no input".to_string()).kind(),
        ErrorKind::PrepareFailed
    );
}

#[test]
fn test_worker_error_classification() {
    let creation = WorkerError::from(ProviderError::ContextCreation("out of memory".to_string()));
    assert_eq!(creation.kind(), Some(ErrorKind::ContextCreation));
    assert_eq!(
        creation.to_string(),
        "Execution context setup failed: Failed to create execution context: out of memory"
    );

    let registration = WorkerError::from(ProviderError::ApiRegistration { name: "eval".to_string() });
    assert_eq!(registration.kind(), Some(ErrorKind::ApiRegistration));

    let busy = WorkerError::NotAccepting { worker: WorkerId(3), status: WorkerStatus::Busy };
    assert_eq!(busy.kind(), None);
    assert_eq!(busy.to_string(), "Worker 3 cannot accept work in Busy status");
    assert_eq!(WorkerError::JoinTimeout(WorkerId(1)).to_string(), "Timed out waiting for worker 1 to stop");
}

#[test]
fn test_pool_error_conversions() {
    let from_worker: PoolError = WorkerError::Detached.into();
    assert!(matches!(from_worker, PoolError::Worker(WorkerError::Detached)));

    let from_config: PoolError = ConfigError::Invalid {
        field: "max_size",
        reason: "must be at least 1".to_string(),
    }
    .into();
    assert_eq!(
        from_config.to_string(),
        "Invalid pool configuration: Invalid configuration for max_size: must be at least 1"
    );

    let other: PoolError = anyhow::anyhow!("spawn failed").into();
    assert_eq!(other.to_string(), "Internal pool error: spawn failed");
    assert_eq!(PoolError::WorkerNotFound(WorkerId(2)).to_string(), "Worker not found: 2");
}
