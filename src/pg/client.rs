//! Node client trait.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{PgError, PgResult};
use super::params::ConnectParams;

/// Bound a node call by `limit`, mapping expiry to [`PgError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, address: String, fut: F) -> PgResult<T>
where
    F: Future<Output = PgResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PgError::Timeout {
            address,
            secs: limit.as_secs(),
        }),
    }
}

/// A row of `pg_replication_slots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSlot {
    pub name: String,
    pub slot_type: String,
    pub active: bool,
    pub restart_lsn: Option<String>,
}

/// WAL position and streaming state of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalActivity {
    pub in_recovery: bool,
    /// Current write LSN on a primary, last replayed LSN on a standby.
    pub lsn: Option<String>,
    pub streaming_replicas: u64,
}

/// Control statements issued against a single Postgres node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Open a connection and run a trivial statement.
    async fn ping(&self, target: &ConnectParams) -> PgResult<()>;

    /// Only authenticate. Fails with `AuthenticationFailed` when the node
    /// rejects the password.
    async fn authenticate(&self, target: &ConnectParams) -> PgResult<()>;

    /// `pg_is_in_recovery()`.
    async fn is_in_recovery(&self, target: &ConnectParams) -> PgResult<bool>;

    /// `pg_current_wal_lsn()`.
    async fn current_wal_lsn(&self, target: &ConnectParams) -> PgResult<String>;

    /// Time since the last replayed transaction. Zero on a primary and on a
    /// standby that has replayed all WAL it received.
    async fn replication_lag_ms(&self, target: &ConnectParams) -> PgResult<u64>;

    /// Number of client backends.
    async fn active_connections(&self, target: &ConnectParams) -> PgResult<u64>;

    /// `pg_terminate_backend` for every client backend not owned by one of
    /// `excluded_users`. Returns how many were terminated.
    async fn terminate_backends(
        &self,
        target: &ConnectParams,
        excluded_users: &[String],
    ) -> PgResult<u64>;

    /// `pg_promote(wait, timeout_secs)`; returns what the database reported.
    async fn promote(&self, target: &ConnectParams, wait: bool, timeout_secs: u32)
        -> PgResult<bool>;

    /// `ALTER USER <user> WITH PASSWORD <new_password>`.
    async fn set_password(
        &self,
        target: &ConnectParams,
        user: &str,
        new_password: &str,
    ) -> PgResult<()>;

    /// Rows of `pg_replication_slots`.
    async fn replication_slots(&self, target: &ConnectParams) -> PgResult<Vec<ReplicationSlot>>;

    /// WAL position and number of streaming standbys.
    async fn wal_activity(&self, target: &ConnectParams) -> PgResult<WalActivity>;
}
