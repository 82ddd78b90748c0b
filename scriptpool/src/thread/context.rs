//! Worker-side view of an execution context.
//!
//! A context never leaves the thread that created it. Other components
//! reach it only by handing a [`Block`] to the owning worker through
//! [`WorkerInterface::execute_block`]; the block then runs on that thread
//! with a [`ContextScope`] borrowing the live context.

use scriptpool_api::{ContextHandle, ContextProvider, Params, ScriptError, Value};

use crate::thread::error::WorkerError;
use crate::thread::worker::{WorkerId, WorkerStatus};

/// Work marshalled onto a worker thread.
pub type Block = Box<dyn FnOnce(&mut ContextScope<'_>) + Send>;

/// Borrowed access to a worker's context for the duration of one block.
pub struct ContextScope<'a> {
    worker_id: WorkerId,
    provider: &'a dyn ContextProvider,
    context: &'a mut ContextHandle,
}

impl<'a> ContextScope<'a> {
    pub(crate) fn new(
        worker_id: WorkerId,
        provider: &'a dyn ContextProvider,
        context: &'a mut ContextHandle,
    ) -> Self {
        Self {
            worker_id,
            provider,
            context,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn context(&mut self) -> &mut ContextHandle {
        self.context
    }

    /// Evaluate a script in the worker's context.
    pub fn evaluate(&mut self, script: &str, params: &Params) -> Result<Value, ScriptError> {
        self.provider.evaluate(self.context, script, params)
    }
}

/// The capability a message bridge needs from its owning worker.
pub trait WorkerInterface: Send + Sync {
    fn worker_id(&self) -> WorkerId;

    fn status(&self) -> WorkerStatus;

    /// Queue `block` to run on the worker thread against its context.
    ///
    /// Blocks run between tasks, in submission order. Fails if the worker
    /// has stopped or never obtained a context.
    fn execute_block(&self, block: Block) -> Result<(), WorkerError>;
}
