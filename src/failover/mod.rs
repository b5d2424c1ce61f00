//! Failover Orchestrator
//!
//! Promotes a replica to primary against live Postgres:
//! - Pre-checks are recorded at creation and are advisory by default
//! - Execution is queued to a worker and survives restarts
//! - Rollback restores registry roles, optionally with a compensating promote
//! - One state-changing action per cluster at a time

mod errors;
mod locks;
mod operation;
mod orchestrator;
pub mod prechecks;
mod state;
mod worker;

pub use errors::{FailoverError, FailoverResult};
pub use locks::ClusterLocks;
pub use operation::{ExecutionStep, FailoverOperation, PreCheck, StepEntry};
pub use orchestrator::{CreateFailover, FailoverOrchestrator, NodeWalReport};
pub use state::{FailoverStatus, FailoverType};
pub use worker::FailoverWorker;
