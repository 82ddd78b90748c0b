//! Host functions exposed as globals inside every execution context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::Value;

/// A host callable. Receives the script's positional arguments and returns
/// a value or an error message that the engine raises as a script exception.
pub type HostFunction = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Named set of host callables registered into each new context.
///
/// Cloning is cheap; functions are shared, not copied.
#[derive(Clone, Default)]
pub struct ApiTable {
    functions: BTreeMap<String, HostFunction>,
}

impl ApiTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, replacing any previous function with the same name.
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.insert(name, function);
        self
    }

    /// Add a function in place. Returns `true` if it replaced an existing one.
    pub fn insert<F>(&mut self, name: impl Into<String>, function: F) -> bool
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions
            .insert(name.into(), Arc::new(function))
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }

    /// Invoke a registered function by name.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        match self.functions.get(name) {
            Some(function) => function(args),
            None => Err(format!("{} is not a function", name)),
        }
    }

    /// Function names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for ApiTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiTable")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
