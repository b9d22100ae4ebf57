//! Endpoint Lifecycle
//!
//! Records, the drama feed, the store and the engine that drives endpoints
//! from spawn through evolution to death.

pub mod decay;
pub mod drama;
pub mod endpoint;
pub mod engine;
pub mod evolution;
pub mod scheduler;
pub mod store;

pub use decay::DecayReport;
pub use drama::{DramaEvent, DramaKind, DramaLog, DRAMA_CAPACITY};
pub use endpoint::{Endpoint, TimelineEvent, TimelineKind, TIMELINE_CAPACITY};
pub use engine::{Invocation, LifecycleEngine, ReloadSummary, DEFAULT_EXECUTION_TIMEOUT};
pub use evolution::{EvolutionOutcome, EvolutionReport};
pub use scheduler::{MaintenanceHandle, MaintenanceScheduler};
pub use store::LifecycleStore;
