//! Federation Errors

use thiserror::Error;
use uuid::Uuid;

use crate::registry::RegistryError;
use crate::store::StoreError;

/// Result type for federation operations
pub type FederationResult<T> = Result<T, FederationError>;

/// Federation protocol errors.
#[derive(Debug, Error)]
pub enum FederationError {
    /// Unknown, expired or already answered request
    #[error("Request {0} not found or already processed")]
    NotFoundOrProcessed(Uuid),

    #[error("Federated node not found: {0}")]
    NodeNotFound(Uuid),

    /// Action not allowed in this instance's current role
    #[error("{0}")]
    InvalidRole(String),

    #[error("Invalid federation request: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid federation credentials")]
    Unauthorized,

    /// The request was issued under an older principle assignment
    #[error("Request {0} was superseded by a newer principle assignment")]
    Superseded(Uuid),

    /// A peer-supplied epoch runs too far ahead, or ours cannot advance
    #[error("Epoch {epoch} is out of range (current {current})")]
    EpochOutOfRange { epoch: u64, current: u64 },

    #[error("Sync transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FederationError {
    pub fn code(&self) -> &'static str {
        match self {
            FederationError::NotFoundOrProcessed(_) => "REQUEST_NOT_FOUND_OR_PROCESSED",
            FederationError::NodeNotFound(_) => "FEDERATED_NODE_NOT_FOUND",
            FederationError::InvalidRole(_) => "FEDERATION_INVALID_ROLE",
            FederationError::Validation(_) => "FEDERATION_INVALID_REQUEST",
            FederationError::Conflict(_) => "FEDERATION_CONFLICT",
            FederationError::Unauthorized => "FEDERATION_UNAUTHORIZED",
            FederationError::Superseded(_) => "FEDERATION_SUPERSEDED",
            FederationError::EpochOutOfRange { .. } => "FEDERATION_EPOCH_OUT_OF_RANGE",
            FederationError::Transport(_) => "FEDERATION_TRANSPORT",
            FederationError::Registry(err) => err.code(),
            FederationError::Store(err) => err.code(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            FederationError::NotFoundOrProcessed(_) | FederationError::NodeNotFound(_) => 404,
            FederationError::InvalidRole(_) | FederationError::Validation(_) => 400,
            FederationError::Conflict(_)
            | FederationError::Superseded(_)
            | FederationError::EpochOutOfRange { .. } => 409,
            FederationError::Unauthorized => 401,
            FederationError::Transport(_) => 502,
            FederationError::Registry(err) => err.status_code(),
            FederationError::Store(err) => err.status_code(),
        }
    }
}
