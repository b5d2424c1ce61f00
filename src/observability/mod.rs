//! Observability
//!
//! Structured logging through `tracing`:
//! - One log line per event, JSON by default
//! - Lifecycle events under their own target so they can be filtered
//! - Secrets never appear in fields

mod events;
mod logger;

pub use events::{LifecycleEvent, LIFECYCLE_TARGET};
pub use logger::{init_logging, LogFormat};
