//! # Task Scheduler Module
//!
//! Sits in front of a `ThreadPool` and decides which pending task runs
//! next.
//!
//! ## Key Concepts
//! - Stable priority queue: higher priority first, submission order within
//!   a priority
//! - Pull-based balancing: tasks stay in the global queue until a worker is
//!   idle, so worker-local queues stay short
//! - Aging: a task waiting longer than `promotion_bound` rises one tier,
//!   so sustained high-priority load cannot starve it
//!
//! ## Triggers
//! `balance_load` runs on every submission, on every worker idle
//! transition reported by the pool, and on a fixed interval.

pub mod group;
pub mod queue;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use scriptpool_api::{Params, Value};

use crate::log_scheduler;
use crate::thread::config::SchedulerConfig;
use crate::thread::error::{PoolError, TaskError, WorkerError};
use crate::thread::pool::{PoolObserver, ThreadPool};
use crate::thread::task::{Task, TaskId, TaskPriority, TaskRef};
use crate::thread::worker::WorkerId;

pub use group::{GroupSummary, TaskGroup, MEMBER_INDEX_PARAM};
pub use queue::{PriorityQueue, QueuedTask};

struct SchedulerInner {
    pool: ThreadPool,
    config: SchedulerConfig,
    queue: Mutex<PriorityQueue>,
    /// Every scheduled task that has not finished yet, queued or running
    registry: Mutex<HashMap<TaskId, TaskRef>>,
    balancer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Priority scheduler over a thread pool. Cloning shares the scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Attach a scheduler to `pool` and start the periodic balancer on
    /// `runtime`.
    pub fn new(
        pool: ThreadPool,
        config: Option<SchedulerConfig>,
        runtime: Handle,
    ) -> Result<Self, PoolError> {
        let config = config.unwrap_or_default();
        config.validate()?;

        let inner = Arc::new(SchedulerInner {
            pool,
            config,
            queue: Mutex::new(PriorityQueue::new()),
            registry: Mutex::new(HashMap::new()),
            balancer: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        });

        let observer: Weak<dyn PoolObserver> = Arc::downgrade(&inner) as Weak<dyn PoolObserver>;
        inner.pool.set_observer(observer);

        let weak = Arc::downgrade(&inner);
        let period = inner.config.balance_interval;
        let balancer = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        inner.balance_load();
                    }
                    None => break,
                }
            }
        });
        *inner.balancer.lock().unwrap() = Some(balancer);

        Ok(Self { inner })
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    /// Wrap and schedule a task, returning the shared handle.
    pub fn schedule_task(&self, task: Task) -> TaskRef {
        let task = Arc::new(task);
        self.schedule(Arc::clone(&task));
        task
    }

    /// Queue a task by priority and try to dispatch immediately.
    pub fn schedule(&self, task: TaskRef) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            task.cancel();
            return;
        }
        if task.is_terminal() {
            return;
        }

        self.inner
            .registry
            .lock()
            .unwrap()
            .insert(task.id(), Arc::clone(&task));
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push(task);
            log_scheduler!("scheduler", "task_queued", pending = queue.len());
        }
        self.inner.balance_load();
    }

    /// Run `script` as `count` tasks, each with `params` plus
    /// `workerId = index`.
    ///
    /// `on_result` fires per successful member; `on_complete` fires once
    /// when every member is terminal.
    pub fn schedule_group<R, C>(
        &self,
        script: &str,
        params: &Params,
        count: usize,
        priority: TaskPriority,
        on_result: R,
        on_complete: C,
    ) -> Result<TaskGroup, TaskError>
    where
        R: Fn(usize, Value) + Send + Sync + 'static,
        C: FnOnce(GroupSummary) + Send + 'static,
    {
        let group = TaskGroup::build(script, params, count, priority, on_result, on_complete)?;
        for task in group.tasks() {
            self.schedule(Arc::clone(task));
        }
        debug!(members = count, "Scheduled task group");
        Ok(group)
    }

    /// Promote aged tasks, then hand queued tasks to idle workers in
    /// priority order. Returns the number dispatched.
    pub fn balance_load(&self) -> usize {
        self.inner.balance_load()
    }

    /// Cancel a scheduled task. A queued task is removed from the queue; a
    /// running one is cancelled best-effort and its result discarded.
    pub fn cancel_task(&self, id: &TaskId) -> bool {
        let queued = self.inner.queue.lock().unwrap().remove(id);
        let task = self.inner.registry.lock().unwrap().remove(id);

        match (queued, task) {
            (Some(entry), _) => {
                log_scheduler!("scheduler", "queued_task_cancelled", task_id = %id);
                entry.task.cancel()
            }
            (None, Some(task)) => {
                log_scheduler!("scheduler", "running_task_cancelled", task_id = %id);
                task.cancel()
            }
            (None, None) => false,
        }
    }

    /// Tasks waiting in the priority queue.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Scheduled tasks that have not finished, queued or running.
    pub fn tracked_count(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    /// Stop balancing, cancel everything queued and shut the pool down.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(balancer) = self.inner.balancer.lock().unwrap().take() {
            balancer.abort();
        }

        let drained = self.inner.queue.lock().unwrap().drain();
        info!(cancelled = drained.len(), "Shutting down scheduler");
        for entry in drained {
            entry.task.cancel();
        }
        self.inner.registry.lock().unwrap().clear();

        self.inner.pool.shutdown().await
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.pending_count())
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl SchedulerInner {
    fn balance_load(&self) -> usize {
        if self.shutting_down.load(Ordering::SeqCst) {
            return 0;
        }

        let mut queue = self.queue.lock().unwrap();
        if let Some(bound) = self.config.promotion_bound {
            let promoted = queue.promote_aged(bound, Instant::now());
            if promoted > 0 {
                log_scheduler!("scheduler", "tasks_promoted", count = promoted);
            }
        }

        let mut dispatched = 0;
        while let Some(entry) = queue.pop() {
            if entry.task.is_terminal() {
                // Cancelled through its own handle while queued.
                self.registry.lock().unwrap().remove(&entry.task.id());
                continue;
            }
            match self.pool.try_dispatch(Arc::clone(&entry.task)) {
                Ok(worker) => {
                    log_scheduler!(
                        "scheduler",
                        "task_dispatched",
                        task_id = %entry.task.id(),
                        worker_id = %worker,
                        priority = ?entry.priority
                    );
                    dispatched += 1;
                }
                Err(_) => {
                    queue.reinsert(entry);
                    break;
                }
            }
        }
        dispatched
    }
}

impl PoolObserver for SchedulerInner {
    fn worker_became_idle(&self, _worker: WorkerId) {
        self.balance_load();
    }

    fn task_finished(&self, _worker: WorkerId, task: &TaskRef) {
        self.registry.lock().unwrap().remove(&task.id());
    }

    fn worker_failed(&self, worker: WorkerId, error: &WorkerError) {
        debug!(worker_id = %worker, "Worker excluded from scheduling: {}", error);
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Ok(balancer) = self.balancer.get_mut() {
            if let Some(balancer) = balancer.take() {
                balancer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::config::ThreadPoolConfig;
    use crate::thread::task::TaskStatus;
    use scriptpool_api::testing::ScriptedProvider;
    use scriptpool_api::ApiTable;
    use std::time::Duration;

    fn single_worker_pool(provider: Arc<ScriptedProvider>) -> ThreadPool {
        let config = ThreadPoolConfig {
            initial_size: 1,
            max_size: 4,
            ..Default::default()
        };
        ThreadPool::new(provider, ApiTable::new(), Some(config), Handle::current()).unwrap()
    }

    async fn until_idle(pool: &ThreadPool, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.idle_worker_count() < count {
            assert!(Instant::now() < deadline, "workers never became idle");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_config_rejected() {
        let pool = single_worker_pool(Arc::new(ScriptedProvider::new()));
        let config = SchedulerConfig {
            balance_interval: Duration::ZERO,
            ..Default::default()
        };
        let result = TaskScheduler::new(pool.clone(), Some(config), Handle::current());
        assert!(matches!(result, Err(PoolError::Config(_))));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_queued_task_never_runs() {
        let provider = Arc::new(ScriptedProvider::new());
        let pool = single_worker_pool(provider.clone());
        until_idle(&pool, 1).await;
        let scheduler = TaskScheduler::new(pool, None, Handle::current()).unwrap();

        let blocker = scheduler.schedule_task(Task::new("hang", Params::new()).unwrap());
        let queued = scheduler.schedule_task(Task::new("never", Params::new()).unwrap());
        assert_eq!(scheduler.pending_count(), 1);

        assert!(scheduler.cancel_task(&queued.id()));
        assert!(!scheduler.cancel_task(&queued.id()));
        assert_eq!(queued.status(), TaskStatus::Cancelled);
        assert_eq!(scheduler.pending_count(), 0);

        provider.release_hung();
        assert_eq!(blocker.wait().await, TaskStatus::Completed);
        assert!(!provider.evaluated_scripts().contains(&"never".to_string()));
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_pending_and_rejects_new() {
        let provider = Arc::new(ScriptedProvider::new());
        let pool = single_worker_pool(provider.clone());
        until_idle(&pool, 1).await;
        let scheduler = TaskScheduler::new(pool, None, Handle::current()).unwrap();

        let running = scheduler.schedule_task(Task::new("hang", Params::new()).unwrap());
        let pending = scheduler.schedule_task(Task::new("later", Params::new()).unwrap());
        let (shutdown, _) = tokio::join!(scheduler.shutdown(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            provider.release_hung();
        });
        shutdown.unwrap();

        assert!(running.is_terminal());
        assert_eq!(pending.status(), TaskStatus::Cancelled);

        let late = scheduler.schedule_task(Task::new("late", Params::new()).unwrap());
        assert_eq!(late.status(), TaskStatus::Cancelled);
        assert_eq!(scheduler.balance_load(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_directly_cancelled_tasks_leave_the_registry() {
        let provider = Arc::new(ScriptedProvider::new());
        let pool = single_worker_pool(provider.clone());
        until_idle(&pool, 1).await;
        let scheduler = TaskScheduler::new(pool, None, Handle::current()).unwrap();

        let blocker = scheduler.schedule_task(Task::new("hang", Params::new()).unwrap());
        let queued: Vec<TaskRef> = (0..10)
            .map(|i| {
                let task = Task::new(format!("low-{}", i), Params::new())
                    .unwrap()
                    .with_priority(TaskPriority::Low);
                scheduler.schedule_task(task)
            })
            .collect();
        assert_eq!(scheduler.tracked_count(), 11);
        for task in &queued {
            assert!(task.cancel());
        }

        provider.release_hung();
        assert_eq!(blocker.wait().await, TaskStatus::Completed);
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.tracked_count() > 0 || scheduler.pending_count() > 0 {
            assert!(Instant::now() < deadline, "cancelled tasks still tracked");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(provider.evaluated_scripts(), vec!["hang".to_string()]);
        scheduler.shutdown().await.unwrap();
    }
}
