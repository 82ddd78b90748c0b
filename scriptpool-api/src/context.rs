//! # Execution Contexts
//!
//! A provider owns the script engine; a context is one isolated global
//! environment inside it. Workers hold exactly one context each, for the
//! whole life of the worker thread.
//!
//! ## Key Concepts
//! - `ContextProvider`: shared, thread-safe engine facade
//! - `ContextHandle`: an opaque, non-`Send` context bound to its creating thread
//! - `ScriptContext`: the engine's own context type, recovered by downcasting
//!
//! ## Implementing a provider
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use scriptpool_api::{
//!     ApiTable, ContextHandle, ContextId, ContextProvider, Params, ProviderError,
//!     ScriptContext, ScriptError, Value,
//! };
//!
//! #[derive(Debug, Default)]
//! struct EchoContext;
//! impl ScriptContext for EchoContext {}
//!
//! #[derive(Debug, Default)]
//! struct EchoProvider { live: AtomicUsize, next: AtomicUsize }
//!
//! impl ContextProvider for EchoProvider {
//!     fn create_context(&self) -> Result<ContextHandle, ProviderError> {
//!         let id = self.next.fetch_add(1, Ordering::SeqCst) as u64;
//!         self.live.fetch_add(1, Ordering::SeqCst);
//!         Ok(ContextHandle::new(ContextId(id), EchoContext))
//!     }
//!     fn register_global_api(&self, _: &mut ContextHandle, _: &ApiTable) -> Result<(), ProviderError> {
//!         Ok(())
//!     }
//!     fn evaluate(&self, _: &mut ContextHandle, script: &str, _: &Params) -> Result<Value, ScriptError> {
//!         Ok(Value::String(script.to_string()))
//!     }
//!     fn destroy_context(&self, context: &mut ContextHandle) {
//!         if context.mark_destroyed() {
//!             self.live.fetch_sub(1, Ordering::SeqCst);
//!         }
//!     }
//!     fn active_context_count(&self) -> usize {
//!         self.live.load(Ordering::SeqCst)
//!     }
//! }
//! ```

use std::fmt;

use downcast_rs::{impl_downcast, Downcast};

use crate::errors::{ProviderError, ScriptError};
use crate::host::ApiTable;
use crate::types::{Params, Value};

/// Identifier a provider assigns to each context it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Marker for an engine's concrete context type.
///
/// Not `Send`: engines such as JavaScriptCore or SpiderMonkey forbid
/// touching a context from any thread but its owner.
pub trait ScriptContext: Downcast + fmt::Debug {}
impl_downcast!(ScriptContext);

/// Opaque handle to one execution context.
pub struct ContextHandle {
    id: ContextId,
    inner: Box<dyn ScriptContext>,
    destroyed: bool,
}

impl ContextHandle {
    /// Wrap an engine context.
    pub fn new<C: ScriptContext>(id: ContextId, context: C) -> Self {
        Self {
            id,
            inner: Box::new(context),
            destroyed: false,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Borrow the engine context as its concrete type.
    pub fn downcast_ref<C: ScriptContext>(&self) -> Option<&C> {
        self.inner.downcast_ref::<C>()
    }

    /// Mutably borrow the engine context as its concrete type.
    pub fn downcast_mut<C: ScriptContext>(&mut self) -> Option<&mut C> {
        self.inner.downcast_mut::<C>()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Record destruction. Returns `true` only the first time, which lets
    /// providers keep `destroy_context` idempotent.
    pub fn mark_destroyed(&mut self) -> bool {
        !std::mem::replace(&mut self.destroyed, true)
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(context = %self.id, "Execution context dropped without destroy_context");
        }
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("destroyed", &self.destroyed)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Engine operations consumed by the worker runtime.
///
/// Every method except `active_context_count` is called on the worker thread
/// that owns the context involved. `evaluate` is synchronous and blocks only
/// that worker.
pub trait ContextProvider: Send + Sync + fmt::Debug {
    /// Allocate a fresh, isolated context.
    fn create_context(&self) -> Result<ContextHandle, ProviderError>;

    /// Expose host callables as globals inside `context`.
    ///
    /// Fails with [`ProviderError::ApiRegistration`] when a name collides
    /// with a reserved global.
    fn register_global_api(
        &self,
        context: &mut ContextHandle,
        api: &ApiTable,
    ) -> Result<(), ProviderError>;

    /// Evaluate `script` with `params` bound in the context.
    ///
    /// Script exceptions must be returned as [`ScriptError`], never raised
    /// as a panic.
    fn evaluate(
        &self,
        context: &mut ContextHandle,
        script: &str,
        params: &Params,
    ) -> Result<Value, ScriptError>;

    /// Release every resource held by `context`. Must be idempotent.
    fn destroy_context(&self, context: &mut ContextHandle);

    /// Number of contexts created and not yet destroyed.
    fn active_context_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Counter(u32);
    impl ScriptContext for Counter {}

    #[derive(Debug)]
    struct Other;
    impl ScriptContext for Other {}

    #[test]
    fn test_handle_downcast() {
        let mut handle = ContextHandle::new(ContextId(4), Counter(1));
        assert_eq!(handle.id(), ContextId(4));
        assert!(handle.downcast_ref::<Other>().is_none());

        handle.downcast_mut::<Counter>().unwrap().0 += 1;
        assert_eq!(handle.downcast_ref::<Counter>().unwrap().0, 2);
    }

    #[test]
    fn test_mark_destroyed_is_one_shot() {
        let mut handle = ContextHandle::new(ContextId(1), Other);
        assert!(!handle.is_destroyed());
        assert!(handle.mark_destroyed());
        assert!(!handle.mark_destroyed());
        assert!(handle.is_destroyed());
    }

    #[test]
    fn test_context_id_display() {
        assert_eq!(ContextId(12).to_string(), "ctx-12");
    }
}
