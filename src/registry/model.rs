//! Registry data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Entity;

/// Replication role of a Postgres node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    /// Accepts writes.
    Primary,
    /// Streams from the primary.
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// Availability as tracked by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "ONLINE"),
            NodeStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// A managed Postgres cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

impl Entity for Cluster {
    const KIND: &'static str = "clusters";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A Postgres node within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// Database used for control connections.
    #[serde(default = "default_database")]
    pub database: String,
    /// Operator-supplied libpq connection string, informational.
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub replication_slot: Option<String>,
    pub updated_at: DateTime<Utc>,
}

fn default_database() -> String {
    "postgres".to_string()
}

impl Node {
    /// Create an ONLINE node with the given role.
    pub fn new(
        cluster_id: Uuid,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        role: NodeRole,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            name: name.into(),
            host: host.into(),
            port,
            role,
            status: NodeStatus::Online,
            database: default_database(),
            connection_string: None,
            replication_slot: None,
            updated_at: Utc::now(),
        }
    }

    /// Set the replication slot name.
    pub fn with_replication_slot(mut self, slot: impl Into<String>) -> Self {
        self.replication_slot = Some(slot.into());
        self
    }

    /// `host:port` for log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }
}

impl Entity for Node {
    const KIND: &'static str = "nodes";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Kind of topology change recorded against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleKind {
    Demoted,
    Promoted,
    RolledBack,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::Demoted => "DEMOTED",
            LifecycleKind::Promoted => "PROMOTED",
            LifecycleKind::RolledBack => "ROLLED_BACK",
        }
    }
}

/// A recorded topology change, kept for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLifecycleEvent {
    pub id: Uuid,
    pub node_id: Uuid,
    pub kind: LifecycleKind,
    pub message: String,
    /// Failover operation that caused the change.
    pub operation_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

impl Entity for NodeLifecycleEvent {
    const KIND: &'static str = "node_events";

    fn key(&self) -> String {
        self.id.to_string()
    }
}
