//! # Scriptpool Context Provider API
//!
//! The contract between the scriptpool worker runtime and the script engine
//! it drives. The runtime never parses or evaluates script text itself; it
//! asks a [`ContextProvider`] to create isolated execution contexts, expose
//! host callables into them, evaluate code and tear them down again.
//!
//! ## Core Components
//!
//! - [`ContextProvider`]: engine-side operations consumed by each worker
//! - [`ContextHandle`]: an opaque, thread-bound execution context
//! - [`ApiTable`]: host functions registered as globals in every context
//! - [`ScriptError`] / [`ProviderError`]: failures surfaced by the engine
//!
//! ## Threading
//!
//! A provider is shared by every worker (`Send + Sync`), but the contexts it
//! hands out are not `Send`: a context is created, used and destroyed on the
//! single worker thread that owns it.
//!
//! ## Module Organization
//!
//! - [`context`]: provider trait and context handle
//! - [`host`]: host API table
//! - [`errors`]: error types
//! - [`types`]: value and parameter aliases
//! - `testing`: a scripted provider for tests (feature `testing`)

pub mod context;
pub mod errors;
pub mod host;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::{ContextHandle, ContextId, ContextProvider, ScriptContext};
pub use errors::{ProviderError, ScriptError};
pub use host::{ApiTable, HostFunction};
pub use types::{Params, Value};
