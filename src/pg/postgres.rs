//! `sqlx`-backed node client.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Row};

use super::client::{NodeClient, ReplicationSlot, WalActivity};
use super::errors::{PgError, PgResult};
use super::params::ConnectParams;

/// SQLSTATE codes for `invalid_password` and `invalid_authorization_specification`.
const AUTH_SQLSTATES: &[&str] = &["28P01", "28000"];

const TERMINATE_BACKENDS_SQL: &str = "\
SELECT count(*) FROM (
    SELECT pg_terminate_backend(pid)
    FROM pg_stat_activity
    WHERE pid <> pg_backend_pid()
      AND backend_type = 'client backend'
      AND usename IS NOT NULL
      AND NOT (usename = ANY($1))
) AS terminated";

/// A standby that has replayed everything it received is not lagging, no
/// matter how long ago the last transaction committed on the primary.
const REPLICATION_LAG_SQL: &str = "\
SELECT CASE
    WHEN NOT pg_is_in_recovery() THEN 0
    WHEN pg_last_wal_receive_lsn() = pg_last_wal_replay_lsn() THEN 0
    ELSE COALESCE(
        (EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())) * 1000)::bigint,
        0
    )
END";

const WAL_ACTIVITY_SQL: &str = "\
SELECT pg_is_in_recovery() AS in_recovery,
       (CASE WHEN pg_is_in_recovery() THEN pg_last_wal_replay_lsn()
             ELSE pg_current_wal_lsn() END)::text AS lsn,
       (SELECT count(*) FROM pg_stat_replication) AS streaming_replicas";

/// Node client talking to real Postgres instances.
#[derive(Debug, Clone)]
pub struct PgNodeClient {
    timeout: Duration,
}

impl PgNodeClient {
    /// Client whose connects and statements are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, target: &ConnectParams) -> PgResult<PgConnection> {
        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .password(&target.password)
            .database(&target.database)
            .application_name("pgfleet")
            .ssl_mode(if target.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });

        match tokio::time::timeout(self.timeout, PgConnection::connect_with(&options)).await {
            Err(_) => Err(PgError::Timeout {
                address: target.address(),
                secs: self.timeout.as_secs(),
            }),
            Ok(Err(err)) => Err(classify_connect_error(target, err)),
            Ok(Ok(conn)) => Ok(conn),
        }
    }

    /// Bound a statement by the client timeout and map its error.
    async fn bounded<T, F>(&self, target: &ConnectParams, fut: F) -> PgResult<T>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(PgError::Timeout {
                address: target.address(),
                secs: self.timeout.as_secs(),
            }),
            Ok(res) => res.map_err(|err| query_error(target, err)),
        }
    }

    async fn close(conn: PgConnection) {
        if let Err(err) = conn.close().await {
            tracing::debug!(error = %err, "error closing node connection");
        }
    }
}

fn classify_connect_error(target: &ConnectParams, err: sqlx::Error) -> PgError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().map_or(false, |code| AUTH_SQLSTATES.contains(&code.as_ref())) {
            return PgError::AuthenticationFailed {
                address: target.address(),
                user: target.user.clone(),
            };
        }
    }
    PgError::Unreachable {
        address: target.address(),
        message: err.to_string(),
    }
}

fn query_error(target: &ConnectParams, err: sqlx::Error) -> PgError {
    PgError::Query {
        address: target.address(),
        message: err.to_string(),
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote an SQL string literal.
///
/// Backslashes are doubled and the `E''` form is used so the literal means
/// the same regardless of `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

#[async_trait]
impl NodeClient for PgNodeClient {
    async fn ping(&self, target: &ConnectParams) -> PgResult<()> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(target, sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&mut conn))
            .await;
        Self::close(conn).await;
        res.map(|_| ())
    }

    async fn authenticate(&self, target: &ConnectParams) -> PgResult<()> {
        let conn = self.connect(target).await?;
        Self::close(conn).await;
        Ok(())
    }

    async fn is_in_recovery(&self, target: &ConnectParams) -> PgResult<bool> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(
                target,
                sqlx::query_scalar::<_, bool>("SELECT pg_is_in_recovery()").fetch_one(&mut conn),
            )
            .await;
        Self::close(conn).await;
        res
    }

    async fn current_wal_lsn(&self, target: &ConnectParams) -> PgResult<String> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(
                target,
                sqlx::query_scalar::<_, String>("SELECT pg_current_wal_lsn()::text")
                    .fetch_one(&mut conn),
            )
            .await;
        Self::close(conn).await;
        res
    }

    async fn replication_lag_ms(&self, target: &ConnectParams) -> PgResult<u64> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(
                target,
                sqlx::query_scalar::<_, i64>(REPLICATION_LAG_SQL).fetch_one(&mut conn),
            )
            .await;
        Self::close(conn).await;
        res.map(|ms| ms.max(0) as u64)
    }

    async fn active_connections(&self, target: &ConnectParams) -> PgResult<u64> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(
                target,
                sqlx::query_scalar::<_, i64>(
                    "SELECT count(*) FROM pg_stat_activity WHERE backend_type = 'client backend'",
                )
                .fetch_one(&mut conn),
            )
            .await;
        Self::close(conn).await;
        res.map(|n| n.max(0) as u64)
    }

    async fn terminate_backends(
        &self,
        target: &ConnectParams,
        excluded_users: &[String],
    ) -> PgResult<u64> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(
                target,
                sqlx::query_scalar::<_, i64>(TERMINATE_BACKENDS_SQL)
                    .bind(excluded_users.to_vec())
                    .fetch_one(&mut conn),
            )
            .await;
        Self::close(conn).await;
        res.map(|n| n.max(0) as u64)
    }

    async fn promote(
        &self,
        target: &ConnectParams,
        wait: bool,
        timeout_secs: u32,
    ) -> PgResult<bool> {
        let mut conn = self.connect(target).await?;
        // pg_promote itself waits up to timeout_secs; allow for that on top
        // of the client timeout.
        let budget = self.timeout + Duration::from_secs(u64::from(timeout_secs));
        let res = match tokio::time::timeout(
            budget,
            sqlx::query_scalar::<_, bool>("SELECT pg_promote($1, $2)")
                .bind(wait)
                .bind(timeout_secs as i32)
                .fetch_one(&mut conn),
        )
        .await
        {
            Err(_) => Err(PgError::Timeout {
                address: target.address(),
                secs: budget.as_secs(),
            }),
            Ok(res) => res.map_err(|err| query_error(target, err)),
        };
        Self::close(conn).await;
        res
    }

    async fn set_password(
        &self,
        target: &ConnectParams,
        user: &str,
        new_password: &str,
    ) -> PgResult<()> {
        let mut conn = self.connect(target).await?;
        // Utility statements cannot take bind parameters. The statement carries
        // the password, so it is never cached on the connection.
        let sql = format!(
            "ALTER USER {} WITH PASSWORD {}",
            quote_ident(user),
            quote_literal(new_password)
        );
        let res = self
            .bounded(
                target,
                sqlx::query(&sql).persistent(false).execute(&mut conn),
            )
            .await;
        Self::close(conn).await;
        res.map(|_| ())
    }

    async fn replication_slots(&self, target: &ConnectParams) -> PgResult<Vec<ReplicationSlot>> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(
                target,
                sqlx::query(
                    "SELECT slot_name::text AS slot_name, slot_type, active, \
                     restart_lsn::text AS restart_lsn \
                     FROM pg_replication_slots ORDER BY slot_name",
                )
                .fetch_all(&mut conn),
            )
            .await;
        Self::close(conn).await;

        res?.iter()
            .map(|row| {
                Ok(ReplicationSlot {
                    name: row.try_get("slot_name")?,
                    slot_type: row.try_get("slot_type")?,
                    active: row.try_get("active")?,
                    restart_lsn: row.try_get("restart_lsn")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|err| query_error(target, err))
    }

    async fn wal_activity(&self, target: &ConnectParams) -> PgResult<WalActivity> {
        let mut conn = self.connect(target).await?;
        let res = self
            .bounded(target, sqlx::query(WAL_ACTIVITY_SQL).fetch_one(&mut conn))
            .await;
        Self::close(conn).await;

        let row = res?;
        let decode = || -> Result<WalActivity, sqlx::Error> {
            let streaming: i64 = row.try_get("streaming_replicas")?;
            Ok(WalActivity {
                in_recovery: row.try_get("in_recovery")?,
                lsn: row.try_get("lsn")?,
                streaming_replicas: streaming.max(0) as u64,
            })
        };
        decode().map_err(|err| query_error(target, err))
    }
}
