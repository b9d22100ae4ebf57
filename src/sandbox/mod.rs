//! Execution Sandbox
//!
//! Runs one stored code body against one input and a capability snapshot.
//! The engine depends only on [`Sandbox`]; how a body becomes executable is
//! up to the implementation.

mod lexer;
mod script;

pub use script::ScriptSandbox;

use serde_json::Value;
use thiserror::Error;

use crate::capabilities::CapabilitySet;

/// A runtime failure inside generated code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

pub trait Sandbox: Send + Sync {
    /// Execute `code` synchronously. Any runtime error is an [`ExecutionError`].
    fn run(&self, code: &str, input: &Value, capabilities: &CapabilitySet) -> Result<Value, ExecutionError>;

    /// Reject a body that could never run, without running it.
    fn validate(&self, _code: &str) -> Result<(), ExecutionError> {
        Ok(())
    }
}
