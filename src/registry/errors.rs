//! Registry Errors

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Node registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("Node {node} does not belong to cluster {cluster}")]
    WrongCluster { node: Uuid, cluster: Uuid },

    #[error("Cluster {cluster} already has primary {existing}")]
    PrimaryExists { cluster: Uuid, existing: Uuid },

    #[error("Node {0} is referenced by a failover operation")]
    NodeInUse(Uuid),

    #[error("Invalid node: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Stable reason string.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::ClusterNotFound(_) => "CLUSTER_NOT_FOUND",
            RegistryError::NodeNotFound(_) => "NODE_NOT_FOUND",
            RegistryError::WrongCluster { .. } => "NODE_WRONG_CLUSTER",
            RegistryError::PrimaryExists { .. } => "PRIMARY_EXISTS",
            RegistryError::NodeInUse(_) => "NODE_IN_USE",
            RegistryError::Invalid(_) => "INVALID_NODE",
            RegistryError::Store(err) => err.code(),
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::ClusterNotFound(_) | RegistryError::NodeNotFound(_) => 404,
            RegistryError::WrongCluster { .. } | RegistryError::Invalid(_) => 400,
            RegistryError::PrimaryExists { .. } | RegistryError::NodeInUse(_) => 409,
            RegistryError::Store(err) => err.status_code(),
        }
    }
}
