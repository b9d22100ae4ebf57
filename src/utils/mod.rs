//! Utils Module
pub mod telemetry;
pub mod truncate;

pub use telemetry::init_tracing;
pub use truncate::{excerpt, truncate_middle};
