//! A deterministic provider for exercising the worker runtime without a
//! real script engine.
//!
//! `ScriptedProvider` understands a handful of single-line directives and
//! echoes anything else back as a string:
//!
//! | script          | behavior                                              |
//! |-----------------|-------------------------------------------------------|
//! | `hang`          | blocks until [`ScriptedProvider::release_hung`]       |
//! | `sleep:<ms>`    | sleeps, then returns `<ms>`                           |
//! | `fail:<msg>`    | raises a script error with `<msg>`                    |
//! | `panic`         | panics inside the provider                            |
//! | `param:<name>`  | returns the named parameter (or `null`)               |
//! | `call:<fn>`     | calls host function `<fn>` with the params object     |
//! | `counter`       | increments and returns a per-context counter          |
//!
//! Every evaluation is recorded in order, together with the context that
//! ran it, so tests can assert on dispatch order and context reuse.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::context::{ContextHandle, ContextId, ContextProvider, ScriptContext};
use crate::errors::{ProviderError, ScriptError};
use crate::host::ApiTable;
use crate::types::{Params, Value};

const RESERVED_GLOBALS: &[&str] = &["globalThis", "eval", "Object", "Function"];

/// Upper bound on how long a `hang` script blocks if never released.
const HANG_LIMIT: Duration = Duration::from_secs(30);

/// One recorded evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub context: ContextId,
    pub script: String,
}

#[derive(Debug)]
struct ScriptedContext {
    owner: ThreadId,
    api: ApiTable,
    counter: i64,
}

impl ScriptContext for ScriptedContext {}

/// Scripted in-process provider. See the module docs for the directives.
#[derive(Debug)]
pub struct ScriptedProvider {
    next_id: AtomicU64,
    active: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    failing_creations: AtomicUsize,
    cross_thread_accesses: AtomicUsize,
    released: AtomicBool,
    hung: AtomicUsize,
    evaluations: Mutex<Vec<Evaluation>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            failing_creations: AtomicUsize::new(0),
            cross_thread_accesses: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            hung: AtomicUsize::new(0),
            evaluations: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` calls to `create_context` fail.
    pub fn fail_next_creations(&self, n: usize) {
        self.failing_creations.store(n, Ordering::SeqCst);
    }

    /// Unblock every `hang` script, now and in the future.
    pub fn release_hung(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Number of `hang` scripts currently blocked.
    pub fn hung_count(&self) -> usize {
        self.hung.load(Ordering::SeqCst)
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Evaluations attempted from a thread other than the context's creator.
    pub fn cross_thread_accesses(&self) -> usize {
        self.cross_thread_accesses.load(Ordering::SeqCst)
    }

    /// Every evaluation so far, in the order evaluation started.
    pub fn evaluations(&self) -> Vec<Evaluation> {
        self.evaluations.lock().unwrap().clone()
    }

    /// Scripts evaluated so far, in start order.
    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.evaluations()
            .into_iter()
            .map(|e| e.script)
            .collect()
    }

    fn check_owner(&self, context: &ScriptedContext) {
        if context.owner != thread::current().id() {
            self.cross_thread_accesses.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hang(&self) -> Result<Value, ScriptError> {
        self.hung.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        while !self.released.load(Ordering::SeqCst) && started.elapsed() < HANG_LIMIT {
            thread::sleep(Duration::from_millis(5));
        }
        self.hung.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

impl ContextProvider for ScriptedProvider {
    fn create_context(&self) -> Result<ContextHandle, ProviderError> {
        let failing = self
            .failing_creations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ProviderError::ContextCreation(
                "scripted creation failure".to_string(),
            ));
        }

        let id = ContextId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.active.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(ContextHandle::new(
            id,
            ScriptedContext {
                owner: thread::current().id(),
                api: ApiTable::new(),
                counter: 0,
            },
        ))
    }

    fn register_global_api(
        &self,
        context: &mut ContextHandle,
        api: &ApiTable,
    ) -> Result<(), ProviderError> {
        if let Some(name) = api.names().find(|name| RESERVED_GLOBALS.contains(name)) {
            return Err(ProviderError::ApiRegistration {
                name: name.to_string(),
            });
        }
        let id = context.id();
        let scripted = context
            .downcast_mut::<ScriptedContext>()
            .ok_or(ProviderError::ContextDestroyed(id.0))?;
        scripted.api = api.clone();
        Ok(())
    }

    fn evaluate(
        &self,
        context: &mut ContextHandle,
        script: &str,
        params: &Params,
    ) -> Result<Value, ScriptError> {
        if context.is_destroyed() {
            return Err(ScriptError::new("context has been destroyed"));
        }
        let id = context.id();
        let scripted = context
            .downcast_mut::<ScriptedContext>()
            .ok_or_else(|| ScriptError::new("foreign context"))?;
        self.check_owner(scripted);

        self.evaluations.lock().unwrap().push(Evaluation {
            context: id,
            script: script.to_string(),
        });

        let script = script.trim();
        let (directive, argument) = match script.split_once(':') {
            Some((directive, argument)) => (directive, argument),
            None => (script, ""),
        };

        match directive {
            "hang" => self.hang(),
            "sleep" => {
                let ms: u64 = argument
                    .parse()
                    .map_err(|_| ScriptError::new(format!("bad sleep duration: {}", argument)))?;
                thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            }
            "fail" => Err(ScriptError::new(argument).at(1, 1)),
            "panic" => panic!("scripted provider panic"),
            "param" => Ok(params.get(argument).cloned().unwrap_or(Value::Null)),
            "call" => {
                let args = [Value::Object(params.clone().into_iter().collect())];
                scripted.api.call(argument, &args).map_err(ScriptError::new)
            }
            "counter" => {
                scripted.counter += 1;
                Ok(json!(scripted.counter))
            }
            _ => Ok(Value::String(script.to_string())),
        }
    }

    fn destroy_context(&self, context: &mut ContextHandle) {
        if context.mark_destroyed() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn active_context_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}
