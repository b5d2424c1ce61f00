//! Sync transport.
//!
//! Moving rows between instances is delegated to a [`SyncTransport`]; the
//! service only records the outcome. The wire protocol is not part of this
//! crate.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{FederationError, FederationResult};
use super::model::FederatedNode;
use crate::registry::{Cluster, Node};

/// Cluster metadata exchanged with a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub clusters: Vec<Cluster>,
    pub nodes: Vec<Node>,
}

impl SyncSnapshot {
    pub fn record_count(&self) -> u64 {
        (self.clusters.len() + self.nodes.len()) as u64
    }
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send our snapshot to `peer`; returns how many records it accepted.
    async fn push(&self, peer: &FederatedNode, snapshot: &SyncSnapshot) -> FederationResult<u64>;

    /// Fetch `peer`'s snapshot.
    async fn pull(&self, peer: &FederatedNode) -> FederationResult<SyncSnapshot>;
}

/// Transport used when no peer delivery is configured.
#[derive(Debug, Default)]
pub struct NullTransport;

#[async_trait]
impl SyncTransport for NullTransport {
    async fn push(&self, peer: &FederatedNode, _snapshot: &SyncSnapshot) -> FederationResult<u64> {
        Err(FederationError::Transport(format!(
            "no sync transport configured for {}",
            peer.domain
        )))
    }

    async fn pull(&self, peer: &FederatedNode) -> FederationResult<SyncSnapshot> {
        Err(FederationError::Transport(format!(
            "no sync transport configured for {}",
            peer.domain
        )))
    }
}

/// In-process peer holding one snapshot.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    remote: Mutex<SyncSnapshot>,
}

impl MemoryTransport {
    pub fn new(remote: SyncSnapshot) -> Self {
        Self {
            remote: Mutex::new(remote),
        }
    }

    /// What the simulated peer currently holds.
    pub fn remote(&self) -> SyncSnapshot {
        self.remote.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    async fn push(&self, _peer: &FederatedNode, snapshot: &SyncSnapshot) -> FederationResult<u64> {
        let mut remote = self
            .remote
            .lock()
            .map_err(|_| FederationError::Transport("peer state poisoned".into()))?;
        *remote = snapshot.clone();
        Ok(snapshot.record_count())
    }

    async fn pull(&self, _peer: &FederatedNode) -> FederationResult<SyncSnapshot> {
        Ok(self.remote())
    }
}
