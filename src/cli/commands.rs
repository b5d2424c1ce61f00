//! CLI command implementations.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};
use crate::app::ControlPlane;
use crate::config::ControlPlaneConfig;
use crate::credential::{Actor, RotationCheck};
use crate::http_server::HttpServer;
use crate::observability::init_logging;

/// Parse arguments and run the selected command.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_command(cli.command));
    if let Err(err) = &result {
        write_error(err.code(), &err.to_string())?;
    }
    result
}

pub async fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Init { config } => init(&config),
        Command::Serve { config } => serve(&config).await,
        Command::RotateCheck {
            config,
            force,
            no_propagate,
        } => rotate_check(&config, force, !no_propagate).await,
    }
}

fn state_dir(config: &ControlPlaneConfig) -> std::path::PathBuf {
    config.data_dir.join("state")
}

/// Create the data directory and federation identity.
///
/// Writes a default configuration file first if none exists.
pub fn init(config_path: &Path) -> CliResult<()> {
    if !config_path.exists() {
        let defaults = ControlPlaneConfig::default();
        fs::write(config_path, serde_json::to_vec_pretty(&defaults)?)?;
    }
    let config = ControlPlaneConfig::load(config_path)?;
    if state_dir(&config).exists() {
        return Err(CliError::AlreadyInitialized(config.data_dir.clone()));
    }
    fs::create_dir_all(&config.data_dir)?;

    let plane = ControlPlane::open(config.clone())?;
    let identity = plane.federation().identity()?;

    write_response(&json!({
        "initialized": true,
        "dataDir": config.data_dir,
        "identity": identity.view(),
    }))
}

fn open_existing(config_path: &Path) -> CliResult<ControlPlane> {
    let config = ControlPlaneConfig::load(config_path)?;
    if !state_dir(&config).exists() {
        return Err(CliError::NotInitialized(config.data_dir.clone()));
    }
    init_logging(&config.log_level, config.log_format);
    Ok(ControlPlane::open(config)?)
}

/// Serve the API until the process is stopped.
pub async fn serve(config_path: &Path) -> CliResult<()> {
    let plane = Arc::new(open_existing(config_path)?);
    let _tasks = plane.spawn_background()?;
    HttpServer::new(plane).start().await?;
    Ok(())
}

/// One rotation check, as a scheduler would run it.
pub async fn rotate_check(config_path: &Path, force: bool, propagate: bool) -> CliResult<()> {
    let plane = open_existing(config_path)?;
    let actor = Actor::system();
    let check = plane.credentials().check_rotation(&actor, force).await?;

    let report = match (&check, propagate) {
        (RotationCheck::Rotated { .. }, true) => {
            Some(plane.credentials().propagate_all(&actor).await?)
        }
        _ => None,
    };
    write_response(&json!({
        "check": check,
        "propagation": report,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_file(tmp: &TempDir) -> std::path::PathBuf {
        let path = tmp.path().join("pgfleet.json");
        let body = json!({ "data_dir": tmp.path().join("data") });
        fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[test]
    fn test_init_twice_fails() {
        let tmp = TempDir::new().unwrap();
        let path = config_file(&tmp);

        init(&path).unwrap();
        assert!(tmp.path().join("data").join("state").exists());
        assert!(matches!(init(&path), Err(CliError::AlreadyInitialized(_))));
    }

    #[tokio::test]
    async fn test_rotate_check_requires_init() {
        let tmp = TempDir::new().unwrap();
        let path = config_file(&tmp);
        let err = rotate_check(&path, false, true).await.unwrap_err();
        assert!(matches!(err, CliError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_rotate_check_without_credential() {
        let tmp = TempDir::new().unwrap();
        let path = config_file(&tmp);
        init(&path).unwrap();
        let err = rotate_check(&path, false, true).await.unwrap_err();
        assert_eq!(err.code(), "PGFLEET_CLI_CREDENTIAL_ERROR");
    }
}
