//! Control-plane configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! `{}`) is valid. A few `PGFLEET_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http_server::HttpServerConfig;
use crate::observability::LogFormat;

/// Configuration errors. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "CONFIG_READ",
            ConfigError::Parse(_) => "CONFIG_PARSE",
            ConfigError::Env { .. } => "CONFIG_ENV",
            ConfigError::Invalid(_) => "CONFIG_INVALID",
        }
    }

    pub fn status_code(&self) -> u16 {
        500
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Directory holding every persisted record and the audit log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub http: HttpServerConfig,

    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub credential: CredentialConfig,

    #[serde(default)]
    pub federation: FederationConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./pgfleet-data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http: HttpServerConfig::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            failover: FailoverConfig::default(),
            credential: CredentialConfig::default(),
            federation: FederationConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load from a file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ControlPlaneConfig = serde_json::from_str(&content)?;
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PGFLEET_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("PGFLEET_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("PGFLEET_HTTP_PORT") {
            self.http.port = port.parse().map_err(|_| ConfigError::Env {
                var: "PGFLEET_HTTP_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(level) = lookup("PGFLEET_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.credential;
        if c.username.trim().is_empty() {
            return Err(ConfigError::Invalid("credential.username is empty".into()));
        }
        if c.history_limit == 0 {
            return Err(ConfigError::Invalid("credential.history_limit must be > 0".into()));
        }
        if c.password_length < 16 {
            return Err(ConfigError::Invalid(
                "credential.password_length must be at least 16".into(),
            ));
        }
        if c.propagation_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "credential.propagation_concurrency must be > 0".into(),
            ));
        }
        if c.rotation_interval_days == 0 {
            return Err(ConfigError::Invalid(
                "credential.rotation_interval_days must be > 0".into(),
            ));
        }
        if self.failover.node_timeout_secs == 0 || c.node_timeout_secs == 0 {
            return Err(ConfigError::Invalid("node timeouts must be > 0".into()));
        }
        if self.federation.promotion_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "federation.promotion_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Path of the append-only audit log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit").join("audit.log")
    }
}

/// Failover pre-check thresholds and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Pre-check ceiling for target replication lag.
    #[serde(default = "default_max_replication_lag_ms")]
    pub max_replication_lag_ms: u64,

    /// Pre-check ceiling for client connections on the source.
    #[serde(default = "default_max_active_connections")]
    pub max_active_connections: u64,

    /// Seconds `pg_promote` waits for the promotion to finish.
    #[serde(default = "default_promote_timeout_secs")]
    pub promote_timeout_secs: u32,

    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Refuse to execute with failing pre-checks unless forced.
    #[serde(default)]
    pub enforce_pre_checks: bool,
}

fn default_max_replication_lag_ms() -> u64 {
    5000
}

fn default_max_active_connections() -> u64 {
    100
}

fn default_promote_timeout_secs() -> u32 {
    60
}

fn default_node_timeout_secs() -> u64 {
    10
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_replication_lag_ms: default_max_replication_lag_ms(),
            max_active_connections: default_max_active_connections(),
            promote_timeout_secs: default_promote_timeout_secs(),
            node_timeout_secs: default_node_timeout_secs(),
            enforce_pre_checks: false,
        }
    }
}

impl FailoverConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

/// Superuser credential policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_rotation_interval_days")]
    pub rotation_interval_days: u32,

    /// Superseded passwords kept for propagation.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_password_length")]
    pub password_length: usize,

    /// Nodes contacted at once by `propagate_all`.
    #[serde(default = "default_propagation_concurrency")]
    pub propagation_concurrency: usize,

    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Require TLS on control connections.
    #[serde(default)]
    pub ssl: bool,

    /// Seconds between scheduled rotation checks.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_username() -> String {
    "postgres".to_string()
}

fn default_rotation_interval_days() -> u32 {
    45
}

fn default_history_limit() -> usize {
    6
}

fn default_password_length() -> usize {
    32
}

fn default_propagation_concurrency() -> usize {
    4
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            rotation_interval_days: default_rotation_interval_days(),
            history_limit: default_history_limit(),
            password_length: default_password_length(),
            propagation_concurrency: default_propagation_concurrency(),
            node_timeout_secs: default_node_timeout_secs(),
            ssl: false,
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl CredentialConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

/// Federation identity defaults and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Name given to a freshly created identity.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    #[serde(default = "default_domain")]
    pub domain: String,

    /// Unanswered promotion requests expire after this long.
    #[serde(default = "default_promotion_timeout_ms")]
    pub promotion_timeout_ms: u64,

    /// Seconds between timeout-resolution polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_instance_name() -> String {
    "pgfleet".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_promotion_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            domain: default_domain(),
            promotion_timeout_ms: default_promotion_timeout_ms(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}
