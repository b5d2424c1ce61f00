//! Lifecycle events.
//!
//! Topology and credential changes emitted as structured `tracing` events
//! under the `pgfleet::lifecycle` target, one event per line.

use std::fmt;

use uuid::Uuid;

/// Target used for every lifecycle event.
pub const LIFECYCLE_TARGET: &str = "pgfleet::lifecycle";

/// Observable control-plane lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    // Failover
    /// Failover operation created
    FailoverCreated,
    /// Failover execution started
    FailoverStarted,
    /// Old primary demoted
    Demoted,
    /// Replica promoted
    Promoted,
    /// Failover reached COMPLETED
    FailoverCompleted,
    /// Failover reached FAILED
    FailoverFailed,
    /// Failover rolled back
    RolledBack,

    // Credential
    CredentialInitialized,
    CredentialRotated,
    PropagationFinished,
    ReenrollmentRequired,

    // Federation
    FederationRoleChanged,
    PromotionRequested,
    PromotionTimedOut,
    PeerDisconnected,
    SyncFinished,

    // Server
    Serving,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::FailoverCreated => "FAILOVER_CREATED",
            LifecycleEvent::FailoverStarted => "FAILOVER_STARTED",
            LifecycleEvent::Demoted => "DEMOTED",
            LifecycleEvent::Promoted => "PROMOTED",
            LifecycleEvent::FailoverCompleted => "FAILOVER_COMPLETED",
            LifecycleEvent::FailoverFailed => "FAILOVER_FAILED",
            LifecycleEvent::RolledBack => "ROLLED_BACK",
            LifecycleEvent::CredentialInitialized => "CREDENTIAL_INITIALIZED",
            LifecycleEvent::CredentialRotated => "CREDENTIAL_ROTATED",
            LifecycleEvent::PropagationFinished => "PROPAGATION_FINISHED",
            LifecycleEvent::ReenrollmentRequired => "REENROLLMENT_REQUIRED",
            LifecycleEvent::FederationRoleChanged => "FEDERATION_ROLE_CHANGED",
            LifecycleEvent::PromotionRequested => "PROMOTION_REQUESTED",
            LifecycleEvent::PromotionTimedOut => "PROMOTION_TIMED_OUT",
            LifecycleEvent::PeerDisconnected => "PEER_DISCONNECTED",
            LifecycleEvent::SyncFinished => "SYNC_FINISHED",
            LifecycleEvent::Serving => "SERVING",
        }
    }

    /// Whether the event indicates something an operator must act on.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::FailoverFailed | LifecycleEvent::ReenrollmentRequired
        )
    }

    /// Emit the event about one entity.
    pub fn emit(&self, entity_id: impl fmt::Display, detail: &str) {
        if self.is_warning() {
            tracing::warn!(
                target: LIFECYCLE_TARGET,
                event = self.as_str(),
                entity_id = %entity_id,
                detail,
            );
        } else {
            tracing::info!(
                target: LIFECYCLE_TARGET,
                event = self.as_str(),
                entity_id = %entity_id,
                detail,
            );
        }
    }

    /// Emit a node-scoped event tied to a failover operation.
    pub fn emit_for_node(&self, node_id: Uuid, operation_id: Uuid) {
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = self.as_str(),
            node_id = %node_id,
            operation_id = %operation_id,
        );
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(LifecycleEvent::Demoted.as_str(), "DEMOTED");
        assert_eq!(LifecycleEvent::Promoted.to_string(), "PROMOTED");
        assert!(LifecycleEvent::ReenrollmentRequired.is_warning());
        assert!(!LifecycleEvent::CredentialRotated.is_warning());
    }
}
