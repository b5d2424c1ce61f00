//! Postgres client errors.

use thiserror::Error;

/// Result type for node client operations
pub type PgResult<T> = Result<T, PgError>;

/// Failures talking to a Postgres node.
#[derive(Debug, Clone, Error)]
pub enum PgError {
    /// Connection could not be established
    #[error("node {address} unreachable: {message}")]
    Unreachable { address: String, message: String },

    /// The node rejected the supplied password
    #[error("password authentication failed for user {user} on {address}")]
    AuthenticationFailed { address: String, user: String },

    /// A statement failed on an open connection
    #[error("query failed on {address}: {message}")]
    Query { address: String, message: String },

    /// The node did not answer in time
    #[error("node {address} timed out after {secs}s")]
    Timeout { address: String, secs: u64 },
}

impl PgError {
    /// Whether the node answered but refused the credential.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, PgError::AuthenticationFailed { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            PgError::Unreachable { .. } => "NODE_UNREACHABLE",
            PgError::AuthenticationFailed { .. } => "NODE_AUTH_FAILED",
            PgError::Query { .. } => "NODE_QUERY_FAILED",
            PgError::Timeout { .. } => "NODE_TIMEOUT",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            PgError::Timeout { .. } => 504,
            _ => 502,
        }
    }
}
