//! Failover Errors

use thiserror::Error;
use uuid::Uuid;

use crate::pg::PgError;
use crate::registry::RegistryError;
use crate::store::StoreError;

/// Result type for failover operations
pub type FailoverResult<T> = Result<T, FailoverError>;

/// Failover orchestration errors.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("Failover operation not found: {0}")]
    NotFound(Uuid),

    /// Requested action is not valid in the operation's current status
    #[error("{0}")]
    InvalidState(String),

    #[error("forbidden transition: {from} -> {to}")]
    ForbiddenTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid failover request: {0}")]
    Validation(String),

    /// Pre-checks are enforced and some failed
    #[error("Pre-checks failed: {}", .0.join(", "))]
    PreChecksFailed(Vec<String>),

    #[error("{0}")]
    Conflict(String),

    #[error("No superuser credential configured")]
    NoCredential,

    #[error("Target node is still in recovery after promotion")]
    StillInRecovery,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Node(#[from] PgError),
}

impl FailoverError {
    pub fn code(&self) -> &'static str {
        match self {
            FailoverError::NotFound(_) => "FAILOVER_NOT_FOUND",
            FailoverError::InvalidState(_) => "FAILOVER_INVALID_STATE",
            FailoverError::ForbiddenTransition { .. } => "FAILOVER_FORBIDDEN_TRANSITION",
            FailoverError::Validation(_) => "FAILOVER_INVALID_REQUEST",
            FailoverError::PreChecksFailed(_) => "FAILOVER_PRECHECKS_FAILED",
            FailoverError::Conflict(_) => "FAILOVER_CONFLICT",
            FailoverError::NoCredential => "CREDENTIAL_NOT_CONFIGURED",
            FailoverError::StillInRecovery => "FAILOVER_TARGET_IN_RECOVERY",
            FailoverError::Registry(err) => err.code(),
            FailoverError::Store(err) => err.code(),
            FailoverError::Node(err) => err.code(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            FailoverError::NotFound(_) => 404,
            FailoverError::InvalidState(_)
            | FailoverError::ForbiddenTransition { .. }
            | FailoverError::Validation(_)
            | FailoverError::PreChecksFailed(_) => 400,
            FailoverError::Conflict(_) | FailoverError::NoCredential => 409,
            FailoverError::StillInRecovery => 502,
            FailoverError::Registry(err) => err.status_code(),
            FailoverError::Store(err) => err.status_code(),
            FailoverError::Node(err) => err.status_code(),
        }
    }
}
