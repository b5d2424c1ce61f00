//! In-process stand-in for a fleet of Postgres nodes.
//!
//! Behaves like the real client from the control plane's point of view:
//! nodes can be unreachable, reject passwords, lag, or fail promotion.
//! Used by the test suites and by dry runs of failover plans.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::{NodeClient, ReplicationSlot, WalActivity};
use super::errors::{PgError, PgResult};
use super::params::ConnectParams;
use crate::registry::{Node, NodeRole};

/// Simulated state of one node.
#[derive(Debug, Clone)]
pub struct FakeNode {
    pub password: String,
    pub reachable: bool,
    pub in_recovery: bool,
    pub replication_lag_ms: u64,
    pub active_connections: u64,
    pub wal_lsn: String,
    /// What `pg_promote` reports when it does not fail.
    pub promote_result: bool,
    /// Makes `pg_promote` fail with this message.
    pub promote_error: Option<String>,
    /// Makes `ALTER USER` fail with this message.
    pub set_password_error: Option<String>,
    pub slots: Vec<ReplicationSlot>,
}

impl FakeNode {
    /// A reachable node accepting `password`.
    pub fn new(password: impl Into<String>, in_recovery: bool) -> Self {
        Self {
            password: password.into(),
            reachable: true,
            in_recovery,
            replication_lag_ms: 0,
            active_connections: 0,
            wal_lsn: "0/3000060".to_string(),
            promote_result: true,
            promote_error: None,
            set_password_error: None,
            slots: Vec::new(),
        }
    }
}

/// One call observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub address: String,
    pub op: &'static str,
    pub password: String,
}

/// A simulated fleet keyed by `host:port`.
#[derive(Debug, Default)]
pub struct FakeFleet {
    nodes: Mutex<HashMap<String, FakeNode>>,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate `node`, in recovery unless it is registered as primary.
    pub fn add_node(&self, node: &Node, password: impl Into<String>) {
        let fake = FakeNode::new(password, node.role == NodeRole::Replica);
        self.insert(&node.address(), fake);
    }

    /// Simulate an arbitrary address.
    pub fn insert(&self, address: &str, fake: FakeNode) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(address.to_string(), fake);
        }
    }

    /// Mutate a simulated node in place.
    pub fn update(&self, address: &str, f: impl FnOnce(&mut FakeNode)) {
        if let Ok(mut nodes) = self.nodes.lock() {
            if let Some(node) = nodes.get_mut(address) {
                f(node);
            }
        }
    }

    /// Snapshot of a simulated node.
    pub fn node(&self, address: &str) -> Option<FakeNode> {
        self.nodes.lock().ok()?.get(address).cloned()
    }

    /// All observed calls, in order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Observed calls of one kind against one address.
    pub fn calls_to(&self, address: &str, op: &str) -> Vec<FakeCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.address == address && c.op == op)
            .collect()
    }

    fn record(&self, target: &ConnectParams, op: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(FakeCall {
                address: target.address(),
                op,
                password: target.password.clone(),
            });
        }
    }

    /// Connect and authenticate, then run `f` against the node state.
    fn with_node<T>(
        &self,
        target: &ConnectParams,
        op: &'static str,
        f: impl FnOnce(&mut FakeNode) -> PgResult<T>,
    ) -> PgResult<T> {
        self.record(target, op);
        let mut nodes = self.nodes.lock().map_err(|_| PgError::Unreachable {
            address: target.address(),
            message: "simulation poisoned".into(),
        })?;
        let node = nodes
            .get_mut(&target.address())
            .filter(|n| n.reachable)
            .ok_or_else(|| PgError::Unreachable {
                address: target.address(),
                message: "connection refused".into(),
            })?;
        if node.password != target.password {
            return Err(PgError::AuthenticationFailed {
                address: target.address(),
                user: target.user.clone(),
            });
        }
        f(node)
    }
}

#[async_trait]
impl NodeClient for FakeFleet {
    async fn ping(&self, target: &ConnectParams) -> PgResult<()> {
        self.with_node(target, "ping", |_| Ok(()))
    }

    async fn authenticate(&self, target: &ConnectParams) -> PgResult<()> {
        self.with_node(target, "authenticate", |_| Ok(()))
    }

    async fn is_in_recovery(&self, target: &ConnectParams) -> PgResult<bool> {
        self.with_node(target, "is_in_recovery", |n| Ok(n.in_recovery))
    }

    async fn current_wal_lsn(&self, target: &ConnectParams) -> PgResult<String> {
        let address = target.address();
        self.with_node(target, "current_wal_lsn", |n| {
            if n.in_recovery {
                return Err(PgError::Query {
                    address,
                    message: "recovery is in progress".into(),
                });
            }
            Ok(n.wal_lsn.clone())
        })
    }

    async fn replication_lag_ms(&self, target: &ConnectParams) -> PgResult<u64> {
        self.with_node(target, "replication_lag_ms", |n| Ok(n.replication_lag_ms))
    }

    async fn active_connections(&self, target: &ConnectParams) -> PgResult<u64> {
        self.with_node(target, "active_connections", |n| Ok(n.active_connections))
    }

    async fn terminate_backends(
        &self,
        target: &ConnectParams,
        _excluded_users: &[String],
    ) -> PgResult<u64> {
        self.with_node(target, "terminate_backends", |n| {
            Ok(std::mem::take(&mut n.active_connections))
        })
    }

    async fn promote(
        &self,
        target: &ConnectParams,
        _wait: bool,
        _timeout_secs: u32,
    ) -> PgResult<bool> {
        let address = target.address();
        self.with_node(target, "promote", |n| {
            if let Some(message) = &n.promote_error {
                return Err(PgError::Query {
                    address,
                    message: message.clone(),
                });
            }
            if n.promote_result {
                n.in_recovery = false;
                n.replication_lag_ms = 0;
            }
            Ok(n.promote_result)
        })
    }

    async fn set_password(
        &self,
        target: &ConnectParams,
        _user: &str,
        new_password: &str,
    ) -> PgResult<()> {
        let address = target.address();
        self.with_node(target, "set_password", |n| {
            if let Some(message) = &n.set_password_error {
                return Err(PgError::Query {
                    address,
                    message: message.clone(),
                });
            }
            n.password = new_password.to_string();
            Ok(())
        })
    }

    async fn replication_slots(&self, target: &ConnectParams) -> PgResult<Vec<ReplicationSlot>> {
        self.with_node(target, "replication_slots", |n| Ok(n.slots.clone()))
    }

    async fn wal_activity(&self, target: &ConnectParams) -> PgResult<WalActivity> {
        self.with_node(target, "wal_activity", |n| {
            Ok(WalActivity {
                in_recovery: n.in_recovery,
                lsn: Some(n.wal_lsn.clone()),
                streaming_replicas: 0,
            })
        })
    }
}
