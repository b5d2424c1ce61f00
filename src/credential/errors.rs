//! Credential Errors

use thiserror::Error;
use uuid::Uuid;

use crate::registry::RegistryError;
use crate::store::StoreError;

/// Result type for credential operations
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Credential engine errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Superuser credential already initialized")]
    AlreadyInitialized,

    #[error("No superuser credential configured")]
    NotInitialized,

    #[error("MFA verification required")]
    MfaRequired,

    #[error("Credential alert not found: {0}")]
    AlertNotFound(Uuid),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CredentialError {
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::AlreadyInitialized => "CREDENTIAL_ALREADY_INITIALIZED",
            CredentialError::NotInitialized => "CREDENTIAL_NOT_CONFIGURED",
            CredentialError::MfaRequired => "MFA_REQUIRED",
            CredentialError::AlertNotFound(_) => "ALERT_NOT_FOUND",
            CredentialError::Registry(err) => err.code(),
            CredentialError::Store(err) => err.code(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            CredentialError::AlreadyInitialized | CredentialError::NotInitialized => 409,
            CredentialError::MfaRequired => 403,
            CredentialError::AlertNotFound(_) => 404,
            CredentialError::Registry(err) => err.status_code(),
            CredentialError::Store(err) => err.status_code(),
        }
    }
}
