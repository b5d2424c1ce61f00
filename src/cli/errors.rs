//! CLI error types. Every CLI error is fatal and exits non-zero.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::credential::CredentialError;
use crate::failover::FailoverError;
use crate::federation::FederationError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Data directory already initialized: {}", .0.display())]
    AlreadyInitialized(PathBuf),

    #[error("Data directory not initialized: {}. Run 'pgfleet init' first.", .0.display())]
    NotInitialized(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Federation(#[from] FederationError),

    /// Startup of the failover worker failed
    #[error("Boot failed: {0}")]
    Boot(#[from] FailoverError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(_) => "PGFLEET_CLI_CONFIG_ERROR",
            CliError::AlreadyInitialized(_) => "PGFLEET_CLI_ALREADY_INITIALIZED",
            CliError::NotInitialized(_) => "PGFLEET_CLI_NOT_INITIALIZED",
            CliError::Store(_) => "PGFLEET_CLI_STORE_ERROR",
            CliError::Credential(_) => "PGFLEET_CLI_CREDENTIAL_ERROR",
            CliError::Federation(_) => "PGFLEET_CLI_FEDERATION_ERROR",
            CliError::Boot(_) => "PGFLEET_CLI_BOOT_FAILED",
            CliError::Io(_) | CliError::Json(_) => "PGFLEET_CLI_IO_ERROR",
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
