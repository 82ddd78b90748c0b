//! # Context Provider Error Types
//!
//! Failures a script engine reports back to the runtime.
//!
//! - `ScriptError`: an exception raised by script code during evaluation.
//!   Always scoped to a single evaluation; never fatal to the worker.
//! - `ProviderError`: the engine could not create a context or could not
//!   expose the host API into it. Fatal to the worker that asked.
//!
//! ## Usage Example
//!
//! ```rust
//! use scriptpool_api::errors::{ProviderError, ScriptError};
//!
//! let err = ScriptError::new("x is not defined").at(3, 14);
//! assert_eq!(err.to_string(), "x is not defined (line 3, column 14)");
//!
//! let err = ProviderError::ApiRegistration { name: "eval".to_string() };
//! assert!(err.to_string().contains("eval"));
//! ```

use std::fmt;

use thiserror::Error;

/// A script-level exception raised during evaluation.
///
/// Carries the engine's message and, when the engine knows it, the source
/// location that raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// Engine-provided description of the exception
    pub message: String,
    /// 1-based line of the failing statement
    pub line: Option<u32>,
    /// 1-based column of the failing statement
    pub column: Option<u32>,
}

impl ScriptError {
    /// Create a script error without location information.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Attach a source location.
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "{} (line {}, column {})", self.message, line, column)
            }
            (Some(line), None) => write!(f, "{} (line {})", self.message, line),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Errors raised by a provider while managing contexts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The engine could not allocate a new context (resource exhaustion).
    #[error("Failed to create execution context: {0}")]
    ContextCreation(String),

    /// A host API name collides with a reserved global.
    #[error("Cannot register host API '{name}': name is reserved")]
    ApiRegistration { name: String },

    /// An operation was attempted on a context that was already destroyed.
    #[error("Execution context {0} has been destroyed")]
    ContextDestroyed(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display_without_location() {
        let err = ScriptError::new("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_script_error_display_line_only() {
        let mut err = ScriptError::new("boom");
        err.line = Some(7);
        assert_eq!(err.to_string(), "boom (line 7)");
    }
}
