//! Store Errors

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by document repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key contains characters that cannot be stored
    #[error("invalid record key: {0:?}")]
    InvalidKey(String),

    /// Filesystem failure
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored document failed checksum validation
    #[error("corrupted record {kind}/{key}: checksum mismatch")]
    Corrupted { kind: &'static str, key: String },

    /// A lock guarding the store was poisoned by a panicking writer
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Stable reason string for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InvalidKey(_) => "STORE_INVALID_KEY",
            StoreError::Io(_) => "STORE_IO",
            StoreError::Serialization(_) => "STORE_SERIALIZATION",
            StoreError::Corrupted { .. } => "STORE_CORRUPTED",
            StoreError::Poisoned => "STORE_POISONED",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::InvalidKey(_) => 400,
            _ => 500,
        }
    }
}
