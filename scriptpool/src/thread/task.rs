//! # Task Module
//!
//! A task is one unit of script work: immutable script text and parameters,
//! a priority, an optional timeout and a lifecycle status.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending -> Preparing -> Ready -> Running -> Completed | Failed
//!    \__________\___________\_________\_____-> Cancelled
//! ```
//!
//! `Preparing -> Failed` is also legal, for a prepare callback that fails.
//! Terminal states are `Completed`, `Failed` and `Cancelled`; illegal
//! transitions fail with `TaskError::InvalidState` and leave the status as
//! it was.
//!
//! ## Ownership
//! Priority, timeout and callbacks are set through consuming builder
//! methods, so they can only change before the task is shared. Once
//! submitted the task lives behind an `Arc` (`TaskRef`) and every mutation
//! goes through its internal lock; the caller keeps a handle for polling,
//! waiting and cancelling.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use scriptpool_api::{Params, Value};

use crate::thread::error::TaskError;

/// Shared handle to a submitted task.
pub type TaskRef = Arc<Task>;

type PrepareCallback = Box<dyn FnOnce(&Task) -> Result<(), String> + Send>;
type SuccessCallback = Box<dyn FnOnce(Value) + Send>;
type ErrorCallback = Box<dyn FnOnce(TaskError) + Send>;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. Ordered `Low < Default < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    Low,
    #[default]
    Default,
    High,
}

impl TaskPriority {
    /// The next tier up, saturating at `High`.
    pub fn promoted(self) -> Self {
        match self {
            TaskPriority::Low => TaskPriority::Default,
            TaskPriority::Default | TaskPriority::High => TaskPriority::High,
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Preparing,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Preparing) | (Preparing, Ready) | (Ready, Running) => true,
            (Running, Completed) | (Running, Failed) | (Preparing, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of settling a task that may already have been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The result was recorded and the matching callback invoked.
    Applied,
    /// The task was cancelled first; the result was dropped.
    Discarded,
}

struct TaskState {
    status: TaskStatus,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    result: Option<Value>,
    error: Option<TaskError>,
}

#[derive(Default)]
struct Callbacks {
    prepare: Option<PrepareCallback>,
    success: Option<SuccessCallback>,
    error: Option<ErrorCallback>,
}

/// A unit of script work. See the module docs for the lifecycle.
pub struct Task {
    id: TaskId,
    script: String,
    params: Params,
    priority: TaskPriority,
    timeout: Option<Duration>,
    created_at: Instant,
    state: Mutex<TaskState>,
    callbacks: Mutex<Callbacks>,
    status_tx: watch::Sender<TaskStatus>,
}

impl Task {
    /// Create a `Pending` task.
    ///
    /// Fails with `InvalidArgument` when the script is empty or whitespace.
    pub fn new(script: impl Into<String>, params: Params) -> Result<Self, TaskError> {
        let script = script.into();
        if script.trim().is_empty() {
            return Err(TaskError::InvalidArgument(
                "script text must not be empty".to_string(),
            ));
        }
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        Ok(Self {
            id: TaskId::new(),
            script,
            params,
            priority: TaskPriority::Default,
            timeout: None,
            created_at: Instant::now(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            }),
            callbacks: Mutex::new(Callbacks::default()),
            status_tx,
        })
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Watchdog timeout for this task, overriding the pool default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs on the worker thread before execution. Returning `Err` fails
    /// the task without evaluating the script.
    pub fn on_prepare<F>(self, callback: F) -> Self
    where
        F: FnOnce(&Task) -> Result<(), String> + Send + 'static,
    {
        self.callbacks.lock().unwrap().prepare = Some(Box::new(callback));
        self
    }

    pub fn on_success<F>(self, callback: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.callbacks.lock().unwrap().success = Some(Box::new(callback));
        self
    }

    /// Invoked once with the failure, timeout or cancellation.
    pub fn on_error<F>(self, callback: F) -> Self
    where
        F: FnOnce(TaskError) + Send + 'static,
    {
        self.callbacks.lock().unwrap().error = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// The script's result, once `Completed`.
    pub fn result(&self) -> Option<Value> {
        self.state.lock().unwrap().result.clone()
    }

    /// The failure, once `Failed` or `Cancelled`.
    pub fn error(&self) -> Option<TaskError> {
        self.state.lock().unwrap().error.clone()
    }

    /// Time spent running; keeps growing while the task is `Running`.
    pub fn duration(&self) -> Duration {
        let state = self.state.lock().unwrap();
        match (state.started_at, state.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Time since the task was created.
    pub fn lifetime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Wait until the task reaches a terminal status.
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// `Pending -> Preparing -> Ready`, running the prepare callback in
    /// between. A failing callback moves the task to `Failed` and invokes the
    /// error callback.
    pub fn prepare(&self) -> Result<(), TaskError> {
        self.advance("prepare", TaskStatus::Preparing)?;

        let callback = self.callbacks.lock().unwrap().prepare.take();
        if let Some(callback) = callback {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(self)))
                .unwrap_or_else(|payload| Err(panic_message(payload)));
            if let Err(reason) = outcome {
                let error = TaskError::PrepareFailed(reason);
                self.settle("prepare", TaskStatus::Preparing, Err(error.clone()))?;
                return Err(error);
            }
        }

        self.advance("prepare", TaskStatus::Ready)
    }

    /// `Ready -> Running`; starts the execution clock. Evaluation itself is
    /// carried out by the owning worker.
    pub fn execute(&self) -> Result<(), TaskError> {
        let mut state = self.state.lock().unwrap();
        if !state.status.can_transition_to(TaskStatus::Running) {
            return Err(TaskError::InvalidState {
                operation: "execute",
                status: state.status,
            });
        }
        state.status = TaskStatus::Running;
        state.started_at = Some(Instant::now());
        self.status_tx.send_replace(TaskStatus::Running);
        Ok(())
    }

    /// `Running -> Completed | Failed`, invoking the matching callback.
    ///
    /// A task cancelled while running keeps its `Cancelled` status and the
    /// result is discarded.
    pub fn complete(&self, result: Result<Value, TaskError>) -> Result<Completion, TaskError> {
        self.settle("complete", TaskStatus::Running, result)
    }

    /// Watchdog path: `Running -> Failed` with a `Timeout` error.
    pub fn time_out(&self, limit: Duration) -> Result<Completion, TaskError> {
        self.settle("time out", TaskStatus::Running, Err(TaskError::Timeout(limit)))
    }

    /// Move any non-terminal task to `Cancelled` and invoke the error
    /// callback with `TaskError::Cancelled`. Returns `false` if the task had
    /// already finished.
    pub fn cancel(&self) -> bool {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Cancelled;
            if state.started_at.is_some() {
                state.finished_at = Some(Instant::now());
            }
            state.error = Some(TaskError::Cancelled);
            self.status_tx.send_replace(TaskStatus::Cancelled);
            std::mem::take(&mut *self.callbacks.lock().unwrap())
        };

        if let Some(callback) = callbacks.error {
            guarded("error", || callback(TaskError::Cancelled));
        }
        true
    }

    fn advance(&self, operation: &'static str, next: TaskStatus) -> Result<(), TaskError> {
        let mut state = self.state.lock().unwrap();
        if !state.status.can_transition_to(next) {
            return Err(TaskError::InvalidState {
                operation,
                status: state.status,
            });
        }
        state.status = next;
        self.status_tx.send_replace(next);
        Ok(())
    }

    fn settle(
        &self,
        operation: &'static str,
        expected: TaskStatus,
        outcome: Result<Value, TaskError>,
    ) -> Result<Completion, TaskError> {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.status == TaskStatus::Cancelled {
                return Ok(Completion::Discarded);
            }
            if state.status != expected {
                return Err(TaskError::InvalidState {
                    operation,
                    status: state.status,
                });
            }
            let next = if outcome.is_ok() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            state.status = next;
            if state.started_at.is_some() {
                state.finished_at = Some(Instant::now());
            }
            match &outcome {
                Ok(value) => state.result = Some(value.clone()),
                Err(error) => state.error = Some(error.clone()),
            }
            self.status_tx.send_replace(next);
            std::mem::take(&mut *self.callbacks.lock().unwrap())
        };

        match outcome {
            Ok(value) => {
                if let Some(callback) = callbacks.success {
                    guarded("success", || callback(value));
                }
            }
            Err(error) => {
                if let Some(callback) = callbacks.error {
                    guarded("error", || callback(error));
                }
            }
        }
        Ok(Completion::Applied)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Run a user callback, containing any panic it raises.
fn guarded<F: FnOnce()>(which: &str, callback: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        warn!(callback = which, "Task callback panicked: {}", panic_message(payload));
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
