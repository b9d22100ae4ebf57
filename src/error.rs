//! Lifecycle Error Taxonomy
//!
//! Failures the engine can hand back to its callers. Only `Execution` is
//! raised on purpose; generation and persistence failures are normally
//! absorbed into health, desperation and the timeline.

use thiserror::Error;

/// Errors surfaced by [`crate::lifecycle::LifecycleEngine`].
///
/// The type is `Clone` because a single spawn result is shared by every
/// caller waiting on the same identifier.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    /// The generating service declined and no replacement could be produced.
    #[error("generation refused for {path}: {reason}")]
    GenerationRefused { path: String, reason: String },

    /// The generating service answered without usable code.
    #[error("generation for {path} returned no usable code")]
    GenerationEmpty { path: String },

    /// The call to the generating service itself failed.
    #[error("generation request for {path} failed: {message}")]
    GenerationTransport { path: String, message: String },

    /// Generated code raised while executing.
    #[error("{message}")]
    Execution { path: String, message: String },

    /// The snapshot could not be written.
    #[error("failed to persist endpoints: {0}")]
    Persistence(String),

    /// No live endpoint exists under the given path.
    #[error("endpoint {0} not found")]
    NotFound(String),
}

impl LifecycleError {
    pub(crate) fn transport(path: &str, err: &anyhow::Error) -> Self {
        Self::GenerationTransport {
            path: path.to_string(),
            message: format!("{:#}", err),
        }
    }

    /// Whether this error came from the generated code rather than the engine.
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;
