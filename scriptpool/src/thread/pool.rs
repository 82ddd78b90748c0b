//! # Thread Pool Module
//!
//! Owns the set of workers and is the only surface through which tasks
//! reach them.
//!
//! ## Key Concepts
//! - Direct assignment: a submitted task goes to the lowest-index idle
//!   worker, or waits in a FIFO submission queue
//! - Resizing: growing spawns workers that become available once their
//!   context is set up; shrinking stops idle workers first and retires busy
//!   ones only after their current task finishes
//! - Delegation: the pool is every worker's delegate and forwards what the
//!   scheduler cares about to a weakly held `PoolObserver`
//!
//! ## Locking
//! Pool state is locked before any worker's state, never the other way
//! round, and neither the observer nor a worker is called back while the
//! pool lock is held.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use scriptpool_api::{ApiTable, ContextProvider};

use crate::thread::bridge::Message;
use crate::thread::config::ThreadPoolConfig;
use crate::thread::error::{PoolError, WorkerError};
use crate::thread::task::TaskRef;
use crate::thread::worker::{Worker, WorkerDelegate, WorkerId, WorkerStatus};
use crate::{log_error, log_scheduler};

/// Notified of pool events that may let more work run. Held weakly.
pub trait PoolObserver: Send + Sync {
    /// A worker went idle and the pool's own queue had nothing for it.
    fn worker_became_idle(&self, worker: WorkerId);

    fn task_finished(&self, _worker: WorkerId, _task: &TaskRef) {}

    fn worker_failed(&self, _worker: WorkerId, _error: &WorkerError) {}
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Workers currently registered, retiring ones included
    pub worker_count: usize,

    /// Size the pool is converging to
    pub target_size: usize,

    pub idle: usize,
    pub busy: usize,
    pub errored: usize,

    /// Tasks waiting in the submission queue
    pub queued_tasks: usize,

    pub is_shutting_down: bool,
}

struct PoolState {
    workers: Vec<Worker>,
    /// Busy workers to tear down once their current task finishes
    retiring: HashSet<WorkerId>,
    /// Workers already told to stop, kept so shutdown can join them
    retired: Vec<Worker>,
    queue: VecDeque<TaskRef>,
    next_id: usize,
    shutting_down: bool,
}

struct PoolInner {
    provider: Arc<dyn ContextProvider>,
    api: ApiTable,
    config: ThreadPoolConfig,
    runtime: Handle,
    state: Mutex<PoolState>,
    observer: RwLock<Option<Weak<dyn PoolObserver>>>,
    self_ref: Weak<PoolInner>,
}

/// A resizable pool of script workers. Cloning shares the same pool.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Build a pool and start `initial_size` workers.
    pub fn new(
        provider: Arc<dyn ContextProvider>,
        api: ApiTable,
        config: Option<ThreadPoolConfig>,
        runtime: Handle,
    ) -> Result<Self, PoolError> {
        let config = config.unwrap_or_default();
        config.validate()?;
        let initial_size = config.initial_size;

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| PoolInner {
            provider,
            api,
            config,
            runtime,
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                retiring: HashSet::new(),
                retired: Vec::new(),
                queue: VecDeque::new(),
                next_id: 0,
                shutting_down: false,
            }),
            observer: RwLock::new(None),
            self_ref: weak.clone(),
        });

        let pool = Self { inner };
        pool.adjust_pool_size(initial_size)?;
        info!(size = initial_size, "Thread pool started");
        Ok(pool)
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.inner.config
    }

    /// Register the observer; replaces any previous one.
    pub fn set_observer(&self, observer: Weak<dyn PoolObserver>) {
        *self.inner.observer.write().unwrap() = Some(observer);
    }

    /// Submit a task. Never blocks: the task is assigned to the first idle
    /// worker or queued. After shutdown the task is cancelled.
    pub fn execute_task(&self, task: TaskRef) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutting_down {
            drop(state);
            task.cancel();
            return;
        }
        match self.inner.assign_to_idle(&state, task) {
            Ok(worker) => {
                log_scheduler!("pool", "task_assigned", worker_id = %worker);
            }
            Err(task) => {
                state.queue.push_back(task);
                log_scheduler!("pool", "task_queued", queued = state.queue.len());
            }
        }
    }

    /// Assign a task only if a worker is idle right now; otherwise hand it
    /// back untouched.
    pub fn try_dispatch(&self, task: TaskRef) -> Result<WorkerId, TaskRef> {
        let state = self.inner.state.lock().unwrap();
        if state.shutting_down {
            return Err(task);
        }
        self.inner.assign_to_idle(&state, task)
    }

    /// Grow or shrink towards `size` (clamped to `max_size`). Returns the new
    /// target size.
    ///
    /// Shrinking stops workers in `Error` or `Starting` first, then idle
    /// workers, most recently idle first. Busy workers are retired: they
    /// finish their current task and are torn down when they go idle.
    pub fn adjust_pool_size(&self, size: usize) -> Result<usize, PoolError> {
        let target = size.min(self.inner.config.max_size);
        if target < size {
            warn!(requested = size, max = self.inner.config.max_size, "Pool size clamped");
        }

        let mut to_stop = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            let active = state.workers.len() - state.retiring.len();

            if target > active {
                let mut needed = target - active;
                // Reprieve retiring workers before spawning new ones.
                while needed > 0 {
                    let Some(&id) = state.retiring.iter().min() else {
                        break;
                    };
                    state.retiring.remove(&id);
                    needed -= 1;
                }
                for _ in 0..needed {
                    let id = WorkerId(state.next_id);
                    state.next_id += 1;
                    let worker = self.inner.spawn_worker(id).map_err(|error| {
                        PoolError::Other(
                            anyhow::Error::new(error).context(format!("failed to spawn worker {}", id)),
                        )
                    })?;
                    state.workers.push(worker);
                }
            } else if target < active {
                let excess = active - target;
                for id in self.inner.shrink_order(&state).into_iter().take(excess) {
                    let index = state.workers.iter().position(|w| w.id() == id);
                    match index {
                        Some(index) if state.workers[index].status() == WorkerStatus::Busy => {
                            state.retiring.insert(id);
                        }
                        Some(index) => to_stop.push(state.workers.remove(index)),
                        None => {}
                    }
                }
            }
        }

        for worker in &to_stop {
            log_scheduler!("pool", "worker_removed", worker_id = %worker.id());
            worker.stop();
        }
        self.inner.state.lock().unwrap().retired.extend(to_stop);

        debug!(size = target, "Pool resized");
        Ok(target)
    }

    /// Post a host message to a worker's bridge.
    pub fn post_message(&self, worker: WorkerId, message: Message) -> Result<(), PoolError> {
        let worker = self.worker(worker).ok_or(PoolError::WorkerNotFound(worker))?;
        worker.bridge().deliver(message);
        Ok(())
    }

    pub fn worker(&self, id: WorkerId) -> Option<Worker> {
        let state = self.inner.state.lock().unwrap();
        state.workers.iter().find(|w| w.id() == id).cloned()
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.inner.state.lock().unwrap().workers.clone()
    }

    /// Re-run context setup on a worker, typically one in `Error` status.
    pub fn reset_worker(&self, id: WorkerId) -> Result<(), PoolError> {
        let worker = self.worker(id).ok_or(PoolError::WorkerNotFound(id))?;
        worker.reset()?;
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().unwrap().workers.len()
    }

    /// Workers that are not retiring.
    pub fn target_size(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.workers.len() - state.retiring.len()
    }

    pub fn idle_worker_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state
            .workers
            .iter()
            .filter(|w| w.status() == WorkerStatus::Idle && !state.retiring.contains(&w.id()))
            .count()
    }

    pub fn queued_task_count(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn worker_statuses(&self) -> Vec<(WorkerId, WorkerStatus)> {
        let state = self.inner.state.lock().unwrap();
        state.workers.iter().map(|w| (w.id(), w.status())).collect()
    }

    /// Contexts currently alive according to the provider.
    pub fn active_context_count(&self) -> usize {
        self.inner.provider.active_context_count()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.state.lock().unwrap();
        let statuses: Vec<WorkerStatus> = state.workers.iter().map(|w| w.status()).collect();
        let count = |status| statuses.iter().filter(|s| **s == status).count();
        PoolMetrics {
            worker_count: state.workers.len(),
            target_size: state.workers.len() - state.retiring.len(),
            idle: count(WorkerStatus::Idle),
            busy: count(WorkerStatus::Busy),
            errored: count(WorkerStatus::Error),
            queued_tasks: state.queue.len(),
            is_shutting_down: state.shutting_down,
        }
    }

    /// Cancel queued and running tasks, stop every worker and wait for the
    /// threads to exit, each bounded by `shutdown_timeout`.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let (workers, queued) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
            state.retiring.clear();
            let mut workers: Vec<Worker> = state.workers.drain(..).collect();
            workers.append(&mut state.retired);
            (workers, std::mem::take(&mut state.queue))
        };
        info!(workers = workers.len(), queued = queued.len(), "Shutting down thread pool");

        for task in queued {
            task.cancel();
        }
        for worker in &workers {
            if let Some(task) = worker.current_task() {
                task.cancel();
            }
            worker.stop();
        }

        let mut failures = Vec::new();
        for worker in &workers {
            if let Err(error) = worker.join(self.inner.config.shutdown_timeout).await {
                log_error!(error, worker_id = %worker.id());
                failures.push(error.to_string());
            }
        }

        if failures.is_empty() {
            info!("Thread pool shut down");
            Ok(())
        } else {
            Err(PoolError::ShutdownError(failures.join("; ")))
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().unwrap().shutting_down
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl PoolInner {
    fn spawn_worker(&self, id: WorkerId) -> Result<Worker, WorkerError> {
        let delegate: Weak<dyn WorkerDelegate> = self.self_ref.clone();
        Worker::spawn(
            id,
            Arc::clone(&self.provider),
            self.api.clone(),
            delegate,
            self.config.worker_config(),
            self.runtime.clone(),
        )
    }

    /// Lowest-index idle, non-retiring worker wins.
    fn assign_to_idle(&self, state: &PoolState, task: TaskRef) -> Result<WorkerId, TaskRef> {
        let mut task = task;
        for worker in &state.workers {
            if state.retiring.contains(&worker.id()) {
                continue;
            }
            match worker.try_assign(task) {
                Ok(()) => return Ok(worker.id()),
                Err((returned, _)) => task = returned,
            }
        }
        Err(task)
    }

    fn shrink_order(&self, state: &PoolState) -> Vec<WorkerId> {
        let mut unusable = Vec::new();
        let mut idle = Vec::new();
        let mut busy = Vec::new();
        for worker in &state.workers {
            if state.retiring.contains(&worker.id()) {
                continue;
            }
            match worker.status() {
                WorkerStatus::Idle => idle.push((worker.idle_since(), worker.id())),
                WorkerStatus::Busy => busy.push(worker.id()),
                _ => unusable.push(worker.id()),
            }
        }
        // Most recently idle first.
        idle.sort_by(|a, b| b.cmp(a));
        busy.reverse();

        unusable
            .into_iter()
            .chain(idle.into_iter().map(|(_, id)| id))
            .chain(busy)
            .collect()
    }

    fn observer(&self) -> Option<Arc<dyn PoolObserver>> {
        self.observer.read().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn find(&self, state: &PoolState, id: WorkerId) -> Option<Worker> {
        state.workers.iter().find(|w| w.id() == id).cloned()
    }
}

impl WorkerDelegate for PoolInner {
    fn worker_did_complete_task(&self, worker: WorkerId, task: &TaskRef) {
        if let Some(observer) = self.observer() {
            observer.task_finished(worker, task);
        }
    }

    fn worker_did_fail(&self, worker: WorkerId, error: &WorkerError) {
        log_error!(error, worker_id = %worker);
        if let Some(observer) = self.observer() {
            observer.worker_failed(worker, error);
        }
    }

    fn worker_did_become_idle(&self, id: WorkerId) {
        let assigned = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }

            if state.retiring.remove(&id) {
                let index = state.workers.iter().position(|w| w.id() == id);
                if let Some(index) = index {
                    let worker = state.workers.remove(index);
                    worker.stop();
                    log_scheduler!("pool", "worker_retired", worker_id = %id);
                    state.retired.push(worker);
                }
                return;
            }

            let Some(worker) = self.find(&state, id) else {
                return;
            };
            let mut assigned = false;
            while let Some(task) = state.queue.pop_front() {
                if task.is_terminal() {
                    continue;
                }
                match worker.try_assign(task) {
                    Ok(()) => {
                        assigned = true;
                        break;
                    }
                    Err((task, _)) => {
                        state.queue.push_front(task);
                        break;
                    }
                }
            }
            assigned
        };

        if !assigned {
            if let Some(observer) = self.observer() {
                observer.worker_became_idle(id);
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.workers.is_empty() {
            debug!(workers = state.workers.len(), "Pool dropped without shutdown; stopping workers");
        }
        for worker in state.workers.iter().chain(state.retired.iter()) {
            worker.stop();
        }
    }
}
