// Scriptpool Worker Runtime
//
// Runs script tasks on a pool of dedicated OS threads, each owning one
// isolated execution context supplied by a `ContextProvider`.

pub mod logging;
pub mod thread;

// Re-export commonly used types
pub use thread::*;
pub use scriptpool_api::{ApiTable, ContextProvider, Params, ProviderError, ScriptError, Value};
