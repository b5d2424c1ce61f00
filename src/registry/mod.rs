//! Node Registry
//!
//! Durable record of each cluster's Postgres nodes. Every other subsystem
//! reads topology from here; only the failover orchestrator and registry
//! operations change roles.
//!
//! Invariant: at most one PRIMARY per cluster.

mod errors;
mod model;
mod nodes;

pub use errors::{RegistryError, RegistryResult};
pub use model::{Cluster, LifecycleKind, Node, NodeLifecycleEvent, NodeRole, NodeStatus};
pub use nodes::{NodeReferences, NodeRegistry};
