//! Postgres Node Client
//!
//! Opens a connection to a single node and issues control statements:
//! `pg_promote`, `pg_terminate_backend`, `pg_is_in_recovery`,
//! `pg_current_wal_lsn`, password authentication tests and
//! `ALTER USER ... PASSWORD`.
//!
//! Every call opens its own short-lived connection; nothing is pooled
//! because the credential used to reach a node can change between calls.

mod client;
mod errors;
pub mod fake;
mod params;
mod postgres;

pub use client::{with_timeout, NodeClient, ReplicationSlot, WalActivity};
pub use errors::{PgError, PgResult};
pub use fake::{FakeCall, FakeFleet, FakeNode};
pub use params::{ConnectParams, CredentialSource, StaticCredentials, SuperuserLogin};
pub use postgres::{quote_ident, quote_literal, PgNodeClient};

/// Users whose backends are never terminated during failover.
pub const SYSTEM_USERS: &[&str] = &["postgres", "replicator", "rdsadmin", "azure_superuser"];
