//! Fan-out groups: one script run as N tasks, one per member index.
//!
//! Each member receives the shared parameters plus `workerId = i`. The
//! group reports every success through `on_result(index, value)` and fires
//! `on_complete` exactly once, when the last member reaches a terminal
//! status.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use scriptpool_api::{Params, Value};

use crate::thread::error::{ErrorKind, TaskError};
use crate::thread::task::{Task, TaskId, TaskPriority, TaskRef, TaskStatus};

/// Parameter carrying a member's index.
pub const MEMBER_INDEX_PARAM: &str = "workerId";

/// How a group's members ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl GroupSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

type CompleteHook = Box<dyn FnOnce(GroupSummary) + Send>;

struct GroupTracker {
    remaining: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    on_complete: Mutex<Option<CompleteHook>>,
}

impl GroupTracker {
    fn record(&self, outcome: TaskStatus) {
        match outcome {
            TaskStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            TaskStatus::Cancelled => self.cancelled.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let hook = self.on_complete.lock().unwrap().take();
            if let Some(hook) = hook {
                hook(self.summary());
            }
        }
    }

    fn summary(&self) -> GroupSummary {
        GroupSummary {
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a scheduled group.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    tasks: Vec<TaskRef>,
}

impl TaskGroup {
    /// Build `count` member tasks. Nothing is scheduled yet.
    pub(crate) fn build<R, C>(
        script: &str,
        params: &Params,
        count: usize,
        priority: TaskPriority,
        on_result: R,
        on_complete: C,
    ) -> Result<Self, TaskError>
    where
        R: Fn(usize, Value) + Send + Sync + 'static,
        C: FnOnce(GroupSummary) + Send + 'static,
    {
        if count == 0 {
            return Err(TaskError::InvalidArgument(
                "a task group needs at least one member".to_string(),
            ));
        }

        let tracker = Arc::new(GroupTracker {
            remaining: AtomicUsize::new(count),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });
        let on_result = Arc::new(on_result);

        let mut tasks = Vec::with_capacity(count);
        for index in 0..count {
            let mut member_params = params.clone();
            member_params.insert(MEMBER_INDEX_PARAM.to_string(), Value::from(index));

            let success = (Arc::clone(&tracker), Arc::clone(&on_result));
            let failure = Arc::clone(&tracker);
            let task = Task::new(script, member_params)?
                .with_priority(priority)
                .on_success(move |value| {
                    let (tracker, on_result) = success;
                    on_result(index, value);
                    tracker.record(TaskStatus::Completed);
                })
                .on_error(move |error| {
                    let outcome = match error.kind() {
                        ErrorKind::Cancelled => TaskStatus::Cancelled,
                        _ => TaskStatus::Failed,
                    };
                    failure.record(outcome);
                });
            tasks.push(Arc::new(task));
        }
        Ok(Self { tasks })
    }

    pub fn tasks(&self) -> &[TaskRef] {
        &self.tasks
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every member and summarise.
    pub async fn wait(&self) -> GroupSummary {
        let mut summary = GroupSummary::default();
        for task in &self.tasks {
            match task.wait().await {
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
                _ => summary.failed += 1,
            }
        }
        summary
    }
}
