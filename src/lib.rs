//! Endpoint Evolution
//!
//! HTTP endpoints whose bodies are written on demand by a code-generating
//! model. Endpoints heal on success, wound on failure, get rewritten when
//! they keep failing, and decay away when nobody calls them.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod generation;
pub mod lifecycle;
pub mod sandbox;
pub mod server;
pub mod utils;

// Re-exports for convenience
pub use capabilities::{CapabilityRegistry, CapabilitySet};
pub use config::EvolutionConfig;
pub use error::{LifecycleError, LifecycleResult};
pub use generation::{GenerationClient, LlmGenerationClient};
pub use lifecycle::{Endpoint, LifecycleEngine, LifecycleStore, MaintenanceScheduler};
pub use sandbox::{Sandbox, ScriptSandbox};
