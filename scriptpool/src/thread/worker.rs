//! # Worker Thread Module
//!
//! A worker is a dedicated OS thread bound to exactly one execution
//! context. It accepts tasks one at a time, runs them against its context
//! and reports every outcome to a delegate.
//!
//! ## Key Concepts
//! - Context affinity: the context is created, used and destroyed on the
//!   worker thread only; other threads reach it through `execute_block`
//! - Commands: tasks, marshalled blocks, context resets and stop requests
//!   arrive on one `flume` channel and are handled in order
//! - Watchdog: a timer on the tokio runtime fails a task that overruns its
//!   timeout and replaces the (possibly hung) thread with a fresh one
//!
//! ## Design Principles
//! - Panics from the provider, callbacks or blocks are contained on the
//!   worker thread and never take it down
//! - The delegate is held weakly and is never called with a lock held
//! - Thread generations: a superseded thread notices it lost its slot when
//!   its evaluation finally returns, discards its context and exits

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use scriptpool_api::{ApiTable, ContextHandle, ContextProvider, ScriptError};

use crate::logging::current_subscriber;
use crate::thread::bridge::MessageBridge;
use crate::thread::config::WorkerConfig;
use crate::thread::context::{Block, ContextScope, WorkerInterface};
use crate::thread::error::{TaskError, WorkerError};
use crate::thread::task::{panic_message, Completion, TaskId, TaskRef};
use crate::{log_error, log_task, log_worker};

/// Identifier of a worker within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Setting up (or resetting) the execution context
    Starting,
    /// Ready to accept a task
    Idle,
    /// Running a task
    Busy,
    /// Context setup failed; excluded from scheduling until reset
    Error,
    /// Thread has exited and the context is destroyed
    Stopped,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receives worker outcomes. Held weakly by each worker.
///
/// Callbacks run on the worker thread (or the watchdog's runtime thread) and
/// must not block for long.
pub trait WorkerDelegate: Send + Sync {
    /// A task consumed by the worker reached a terminal status.
    fn worker_did_complete_task(&self, worker: WorkerId, task: &TaskRef);

    /// The worker could not obtain a context or its thread died.
    fn worker_did_fail(&self, worker: WorkerId, error: &WorkerError);

    /// The worker has a context and nothing left to run.
    fn worker_did_become_idle(&self, _worker: WorkerId) {}
}

enum Command {
    Drain,
    Block(Block),
    ResetContext,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
    Superseded,
}

struct WorkerState {
    status: WorkerStatus,
    pending: VecDeque<TaskRef>,
    idle_since: Option<Instant>,
    stopping: bool,
}

/// The task currently under evaluation, guarded by the thread generation
/// that owns it.
struct RunSlot {
    generation: u64,
    running: Option<TaskRef>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
}

struct WorkerShared {
    id: WorkerId,
    provider: Arc<dyn ContextProvider>,
    api: ApiTable,
    delegate: Weak<dyn WorkerDelegate>,
    config: WorkerConfig,
    runtime: Handle,
    dispatch: tracing::Dispatch,
    state: Mutex<WorkerState>,
    slot: Mutex<RunSlot>,
    commands: flume::Sender<Command>,
    receiver: flume::Receiver<Command>,
    bridge: MessageBridge,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a worker thread. Cloning shares the same worker.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    /// Start a worker thread. The worker is `Starting` until its context is
    /// ready, then `Idle` (or `Error` if setup failed).
    pub fn spawn(
        id: WorkerId,
        provider: Arc<dyn ContextProvider>,
        api: ApiTable,
        delegate: Weak<dyn WorkerDelegate>,
        config: WorkerConfig,
        runtime: Handle,
    ) -> Result<Self, WorkerError> {
        let (commands, receiver) = flume::unbounded();
        let shared = Arc::new_cyclic(|weak: &Weak<WorkerShared>| {
            let owner: Weak<dyn WorkerInterface> = weak.clone();
            WorkerShared {
                id,
                provider,
                api,
                delegate,
                config,
                runtime,
                dispatch: current_subscriber(),
                state: Mutex::new(WorkerState {
                    status: WorkerStatus::Starting,
                    pending: VecDeque::new(),
                    idle_since: None,
                    stopping: false,
                }),
                slot: Mutex::new(RunSlot {
                    generation: 0,
                    running: None,
                    watchdog: None,
                }),
                commands,
                receiver,
                bridge: MessageBridge::new(owner),
                thread_handle: Mutex::new(None),
            }
        });

        shared.start_thread(0)?;
        log_worker!(id, "spawned");
        Ok(Self { shared })
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }

    pub fn bridge(&self) -> &MessageBridge {
        &self.shared.bridge
    }

    /// When the worker last became idle; `None` unless currently idle.
    pub fn idle_since(&self) -> Option<Instant> {
        self.shared.state.lock().unwrap().idle_since
    }

    /// Tasks accepted but not yet started.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    /// The task under evaluation, if any.
    pub fn current_task(&self) -> Option<TaskRef> {
        self.shared.slot.lock().unwrap().running.clone()
    }

    /// Hand a task to this worker. Only accepted while `Idle`.
    pub fn execute_task(&self, task: TaskRef) -> Result<(), WorkerError> {
        self.try_assign(task).map_err(|(_, status)| WorkerError::NotAccepting {
            worker: self.shared.id,
            status,
        })
    }

    /// Like `execute_task`, but hands the task back on rejection.
    pub(crate) fn try_assign(&self, task: TaskRef) -> Result<(), (TaskRef, WorkerStatus)> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.status != WorkerStatus::Idle || state.stopping {
                return Err((task, state.status));
            }
            state.status = WorkerStatus::Busy;
            state.idle_since = None;
            state.pending.push_back(task);
        }
        let _ = self.shared.commands.send(Command::Drain);
        Ok(())
    }

    /// Run `block` on the worker thread against its context.
    pub fn execute_block<F>(&self, block: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&mut ContextScope<'_>) + Send + 'static,
    {
        self.shared.execute_block(Box::new(block))
    }

    /// Swap the status, then run `completion` with the previous status.
    pub fn update_status<F>(&self, status: WorkerStatus, completion: F) -> WorkerStatus
    where
        F: FnOnce(WorkerStatus),
    {
        self.shared.update_status(status, completion)
    }

    /// Discard the current context and set up a new one.
    ///
    /// Allowed from `Idle` (a clean slate) or `Error` (manual recovery).
    pub fn reset(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match state.status {
                WorkerStatus::Idle | WorkerStatus::Error if !state.stopping => {
                    state.status = WorkerStatus::Starting;
                    state.idle_since = None;
                }
                status => {
                    return Err(WorkerError::NotAccepting {
                        worker: self.shared.id,
                        status,
                    })
                }
            }
        }
        log_worker!(self.shared.id, "context_reset_requested");
        let _ = self.shared.commands.send(Command::ResetContext);
        Ok(())
    }

    /// Ask the thread to exit once its current task (if any) finishes.
    ///
    /// Pending tasks are cancelled, the context is destroyed and undelivered
    /// messages are dropped.
    pub fn stop(&self) {
        let already = {
            let mut state = self.shared.state.lock().unwrap();
            std::mem::replace(&mut state.stopping, true)
        };
        if !already {
            let _ = self.shared.commands.send(Command::Stop);
        }
    }

    /// Wait for the worker thread to exit.
    pub async fn join(&self, timeout: Duration) -> Result<(), WorkerError> {
        let handle = self.shared.thread_handle.lock().unwrap().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let joined = tokio::task::spawn_blocking(move || handle.join());
        match tokio::time::timeout(timeout, joined).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(payload))) => Err(WorkerError::Panicked(panic_message(payload))),
            Ok(Err(e)) => Err(WorkerError::Panicked(e.to_string())),
            Err(_) => Err(WorkerError::JoinTimeout(self.shared.id)),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("status", &state.status)
            .field("pending", &state.pending.len())
            .field("stopping", &state.stopping)
            .finish()
    }
}

impl WorkerInterface for WorkerShared {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    fn status(&self) -> WorkerStatus {
        self.state.lock().unwrap().status
    }

    fn execute_block(&self, block: Block) -> Result<(), WorkerError> {
        let status = {
            let state = self.state.lock().unwrap();
            if state.stopping {
                WorkerStatus::Stopped
            } else {
                state.status
            }
        };
        if matches!(status, WorkerStatus::Error | WorkerStatus::Stopped) {
            return Err(WorkerError::NotAccepting {
                worker: self.id,
                status,
            });
        }
        self.commands
            .send(Command::Block(block))
            .map_err(|_| WorkerError::NotAccepting {
                worker: self.id,
                status: WorkerStatus::Stopped,
            })
    }
}

impl WorkerShared {
    fn start_thread(self: &Arc<Self>, generation: u64) -> Result<(), WorkerError> {
        let shared = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("{}{}", self.config.thread_name_prefix, self.id))
            .spawn(move || shared.thread_main(generation))
            .map_err(|e| WorkerError::ThreadSpawn(e.to_string()))?;

        // A replaced handle belongs to an abandoned thread; dropping it
        // detaches that thread.
        *self.thread_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn thread_main(self: Arc<Self>, generation: u64) {
        let dispatch = self.dispatch.clone();
        tracing::dispatcher::with_default(&dispatch, || {
            let span = crate::worker_span!(self.id, generation = generation);
            let _enter = span.enter();
            let _runtime = self.runtime.enter();

            // Owned out here so the context outlives an unwinding `run`.
            let mut context = None;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(generation, &mut context)));
            if let Err(payload) = outcome {
                let error = WorkerError::Panicked(panic_message(payload));
                log_error!(error, worker_id = %self.id);
                if let Some(mut context) = context.take() {
                    let destroyed = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.provider.destroy_context(&mut context)
                    }));
                    if destroyed.is_err() {
                        warn!(worker_id = %self.id, "Provider panicked destroying context");
                    }
                }
                self.update_status(WorkerStatus::Error, |_| {});
                self.notify_failure(&error);
            }
        });
    }

    fn run(self: &Arc<Self>, generation: u64, context: &mut Option<ContextHandle>) {
        *context = self.establish_context();
        let mut flow = self.resume(context, generation);

        while flow == Flow::Continue {
            let Ok(command) = self.receiver.recv() else {
                break;
            };
            flow = match command {
                Command::Drain => self.resume(context, generation),
                Command::Block(block) => {
                    self.run_block(block, context.as_mut());
                    Flow::Continue
                }
                Command::ResetContext => {
                    if let Some(mut old) = context.take() {
                        self.provider.destroy_context(&mut old);
                    }
                    *context = self.establish_context();
                    self.resume(context, generation)
                }
                Command::Stop => Flow::Stop,
            };
        }

        if flow == Flow::Superseded {
            if let Some(mut stale) = context.take() {
                self.provider.destroy_context(&mut stale);
            }
            log_worker!(self.id, "superseded_thread_exited", generation = generation);
            return;
        }
        self.teardown(context.take());
    }

    /// Create the context and register the host API. On failure the worker
    /// goes to `Error` and the delegate is told; there is no retry.
    fn establish_context(&self) -> Option<ContextHandle> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.setup_context()))
            .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload))));

        match result {
            Ok(context) => {
                log_worker!(self.id, "context_ready", context = %context.id());
                if self.bridge.buffered_message_count() > 0 {
                    self.bridge.schedule_delivery();
                }
                Some(context)
            }
            Err(error) => {
                log_error!(error, worker_id = %self.id);
                let abandoned = {
                    let mut state = self.state.lock().unwrap();
                    state.status = WorkerStatus::Error;
                    state.idle_since = None;
                    std::mem::take(&mut state.pending)
                };
                for task in abandoned {
                    task.cancel();
                }
                self.notify_failure(&error);
                None
            }
        }
    }

    fn setup_context(&self) -> Result<ContextHandle, WorkerError> {
        let mut context = self.provider.create_context()?;
        if let Err(error) = self.provider.register_global_api(&mut context, &self.api) {
            self.provider.destroy_context(&mut context);
            return Err(error.into());
        }
        Ok(context)
    }

    fn resume(self: &Arc<Self>, context: &mut Option<ContextHandle>, generation: u64) -> Flow {
        match context.as_mut() {
            Some(context) => self.drain_tasks(context, generation),
            None => Flow::Continue,
        }
    }

    /// Run pending tasks in FIFO order, then go idle.
    fn drain_tasks(self: &Arc<Self>, context: &mut ContextHandle, generation: u64) -> Flow {
        loop {
            let (next, became_idle) = {
                let mut state = self.state.lock().unwrap();
                match state.pending.pop_front() {
                    Some(task) => {
                        state.status = WorkerStatus::Busy;
                        (Some(task), false)
                    }
                    None if matches!(state.status, WorkerStatus::Busy | WorkerStatus::Starting) => {
                        state.status = WorkerStatus::Idle;
                        state.idle_since = Some(Instant::now());
                        (None, true)
                    }
                    None => (None, false),
                }
            };

            match next {
                Some(task) => {
                    if self.run_task(task, context, generation) == Flow::Superseded {
                        return Flow::Superseded;
                    }
                }
                None => {
                    if became_idle {
                        debug!(worker_id = %self.id, "Worker is idle");
                        if let Some(delegate) = self.delegate.upgrade() {
                            delegate.worker_did_become_idle(self.id);
                        }
                    }
                    return Flow::Continue;
                }
            }
        }
    }

    fn run_task(
        self: &Arc<Self>,
        task: TaskRef,
        context: &mut ContextHandle,
        generation: u64,
    ) -> Flow {
        let span = crate::task_span!(task.id(), priority = ?task.priority());
        let _enter = span.enter();

        if task.prepare().is_ok() && task.execute().is_ok() {
            log_task!(task.id(), "started");
            self.arm_watchdog(&task, generation);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.provider.evaluate(context, task.script(), task.params())
            }))
            .unwrap_or_else(|payload| {
                Err(ScriptError::new(format!(
                    "script engine panicked: {}",
                    panic_message(payload)
                )))
            });

            if !self.disarm_watchdog(task.id(), generation) {
                return Flow::Superseded;
            }

            match task.complete(outcome.map_err(TaskError::from)) {
                Ok(Completion::Applied) => {
                    log_task!(task.id(), "finished", status = %task.status(), duration = ?task.duration());
                }
                Ok(Completion::Discarded) => {
                    log_task!(task.id(), "result_discarded");
                }
                Err(error) => warn!(task_id = %task.id(), "Failed to complete task: {}", error),
            }
        } else {
            log_task!(task.id(), "skipped", status = %task.status());
        }

        if let Some(delegate) = self.delegate.upgrade() {
            delegate.worker_did_complete_task(self.id, &task);
        }
        Flow::Continue
    }

    fn arm_watchdog(self: &Arc<Self>, task: &TaskRef, generation: u64) {
        let mut slot = self.slot.lock().unwrap();
        slot.running = Some(Arc::clone(task));

        let limit = self.config.effective_timeout(task.timeout());
        if let Some(limit) = limit {
            let weak = Arc::downgrade(self);
            let task_id = task.id();
            slot.watchdog = Some(self.runtime.spawn(async move {
                tokio::time::sleep(limit).await;
                if let Some(shared) = weak.upgrade() {
                    shared.on_watchdog(task_id, generation, limit);
                }
            }));
        }
    }

    /// Returns `false` if the watchdog already took the slot, meaning this
    /// thread has been replaced.
    fn disarm_watchdog(&self, task_id: TaskId, generation: u64) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.generation != generation {
            return false;
        }
        if slot.running.as_ref().map(|t| t.id()) == Some(task_id) {
            slot.running = None;
        }
        if let Some(watchdog) = slot.watchdog.take() {
            watchdog.abort();
        }
        true
    }

    fn on_watchdog(self: &Arc<Self>, task_id: TaskId, generation: u64, limit: Duration) {
        let (task, next_generation) = {
            let mut slot = self.slot.lock().unwrap();
            if slot.generation != generation
                || slot.running.as_ref().map(|t| t.id()) != Some(task_id)
            {
                return;
            }
            let Some(task) = slot.running.take() else {
                return;
            };
            slot.watchdog = None;
            slot.generation += 1;
            (task, slot.generation)
        };

        let _ = task.time_out(limit);
        warn!(
            worker_id = %self.id,
            task_id = %task_id,
            "Task exceeded its {:?} timeout; replacing execution context",
            limit
        );

        let stopping = {
            let mut state = self.state.lock().unwrap();
            state.status = if state.stopping {
                WorkerStatus::Stopped
            } else {
                WorkerStatus::Starting
            };
            state.idle_since = None;
            state.stopping
        };

        if let Some(delegate) = self.delegate.upgrade() {
            delegate.worker_did_complete_task(self.id, &task);
        }

        if stopping {
            // Nobody is left to run the queued stop command.
            self.teardown(None);
            return;
        }
        if let Err(error) = self.start_thread(next_generation) {
            log_error!(error, worker_id = %self.id);
            self.update_status(WorkerStatus::Error, |_| {});
            self.notify_failure(&error);
        }
    }

    fn run_block(&self, block: Block, context: Option<&mut ContextHandle>) {
        let Some(context) = context else {
            warn!(worker_id = %self.id, "Dropping block: worker has no execution context");
            return;
        };
        let mut scope = ContextScope::new(self.id, self.provider.as_ref(), context);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| block(&mut scope))) {
            warn!(worker_id = %self.id, "Block panicked: {}", panic_message(payload));
        }
    }

    fn teardown(&self, context: Option<ContextHandle>) {
        if let Some(mut context) = context {
            self.provider.destroy_context(&mut context);
        }
        let abandoned = {
            let mut state = self.state.lock().unwrap();
            state.status = WorkerStatus::Stopped;
            state.idle_since = None;
            std::mem::take(&mut state.pending)
        };
        for task in abandoned {
            task.cancel();
        }
        let dropped = self.bridge.clear_message_buffer();
        log_worker!(self.id, "stopped", dropped_messages = dropped);
    }

    fn update_status<F>(&self, status: WorkerStatus, completion: F) -> WorkerStatus
    where
        F: FnOnce(WorkerStatus),
    {
        let previous = {
            let mut state = self.state.lock().unwrap();
            state.idle_since = (status == WorkerStatus::Idle).then(Instant::now);
            std::mem::replace(&mut state.status, status)
        };
        completion(previous);
        previous
    }

    fn notify_failure(&self, error: &WorkerError) {
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.worker_did_fail(self.id, error);
        }
    }
}
