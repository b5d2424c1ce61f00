//! Node registry operations.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use super::errors::{RegistryError, RegistryResult};
use super::model::{Cluster, LifecycleKind, Node, NodeLifecycleEvent, NodeRole, NodeStatus};
use crate::store::{MemoryRepository, Repository, StoreError};

/// Answers whether something still references a node.
///
/// Implemented by the failover orchestrator so nodes referenced by a
/// failover operation cannot be removed.
pub trait NodeReferences {
    fn is_referenced(&self, node_id: Uuid) -> RegistryResult<bool>;
}

/// Durable registry of clusters and their nodes.
pub struct NodeRegistry {
    clusters: Arc<dyn Repository<Cluster>>,
    nodes: Arc<dyn Repository<Node>>,
    events: Arc<dyn Repository<NodeLifecycleEvent>>,
    /// Role changes read-modify-write several nodes at once.
    write_lock: Mutex<()>,
}

impl NodeRegistry {
    /// Create a registry over the given repositories.
    pub fn new(
        clusters: Arc<dyn Repository<Cluster>>,
        nodes: Arc<dyn Repository<Node>>,
        events: Arc<dyn Repository<NodeLifecycleEvent>>,
    ) -> Self {
        Self {
            clusters,
            nodes,
            events,
            write_lock: Mutex::new(()),
        }
    }

    /// Registry backed by in-memory repositories.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
        )
    }

    fn guard(&self) -> RegistryResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| RegistryError::Store(StoreError::Poisoned))
    }

    // =========================================================================
    // CLUSTERS
    // =========================================================================

    /// Create a new cluster.
    pub fn create_cluster(&self, name: impl Into<String>) -> RegistryResult<Cluster> {
        let cluster = Cluster::new(name);
        if cluster.name.trim().is_empty() {
            return Err(RegistryError::Invalid("cluster name is empty".into()));
        }
        self.clusters.put(&cluster)?;
        Ok(cluster)
    }

    /// Insert or replace a cluster record as received from a peer.
    pub fn upsert_cluster(&self, cluster: &Cluster) -> RegistryResult<()> {
        self.clusters.put(cluster)?;
        Ok(())
    }

    pub fn get_cluster(&self, id: Uuid) -> RegistryResult<Cluster> {
        self.clusters
            .get(&id.to_string())?
            .ok_or(RegistryError::ClusterNotFound(id))
    }

    pub fn list_clusters(&self) -> RegistryResult<Vec<Cluster>> {
        Ok(self.clusters.list()?)
    }

    // =========================================================================
    // NODES
    // =========================================================================

    /// Register a node, enforcing the single-primary invariant.
    pub fn register_node(&self, node: Node) -> RegistryResult<Node> {
        if node.host.trim().is_empty() {
            return Err(RegistryError::Invalid("host is empty".into()));
        }
        if node.port == 0 {
            return Err(RegistryError::Invalid("port must be non-zero".into()));
        }
        self.get_cluster(node.cluster_id)?;

        let _guard = self.guard()?;
        if node.role == NodeRole::Primary {
            if let Some(existing) = self.primary_of(node.cluster_id)? {
                if existing.id != node.id {
                    return Err(RegistryError::PrimaryExists {
                        cluster: node.cluster_id,
                        existing: existing.id,
                    });
                }
            }
        }
        self.nodes.put(&node)?;
        tracing::info!(
            node_id = %node.id,
            cluster_id = %node.cluster_id,
            address = %node.address(),
            role = %node.role,
            "node registered"
        );
        Ok(node)
    }

    /// Look up a node.
    pub fn get_node(&self, id: Uuid) -> RegistryResult<Node> {
        self.nodes
            .get(&id.to_string())?
            .ok_or(RegistryError::NodeNotFound(id))
    }

    /// Nodes of one cluster, ordered by id.
    pub fn list_nodes(&self, cluster_id: Uuid) -> RegistryResult<Vec<Node>> {
        Ok(self.nodes.find(&|n: &Node| n.cluster_id == cluster_id)?)
    }

    /// Every registered node, ordered by id.
    pub fn all_nodes(&self) -> RegistryResult<Vec<Node>> {
        Ok(self.nodes.list()?)
    }

    /// Current primary of a cluster, if any.
    pub fn primary_of(&self, cluster_id: Uuid) -> RegistryResult<Option<Node>> {
        Ok(self
            .nodes
            .find(&|n: &Node| n.cluster_id == cluster_id && n.role == NodeRole::Primary)?
            .into_iter()
            .next())
    }

    /// Change a node's availability.
    pub fn set_status(&self, id: Uuid, status: NodeStatus) -> RegistryResult<Node> {
        let _guard = self.guard()?;
        let mut node = self.get_node(id)?;
        node.status = status;
        node.updated_at = Utc::now();
        self.nodes.put(&node)?;
        Ok(node)
    }

    /// Move the primary role of a cluster from one node to another.
    ///
    /// `from` is written as REPLICA before `to` is written as PRIMARY so the
    /// single-primary invariant holds at every intermediate point. Applying
    /// the same transfer twice is a no-op.
    pub fn transfer_primary(
        &self,
        from: Uuid,
        from_status: NodeStatus,
        to: Uuid,
        to_status: NodeStatus,
    ) -> RegistryResult<(Node, Node)> {
        let _guard = self.guard()?;
        let mut old = self.get_node(from)?;
        let mut new = self.get_node(to)?;
        if old.cluster_id != new.cluster_id {
            return Err(RegistryError::WrongCluster {
                node: new.id,
                cluster: old.cluster_id,
            });
        }

        let now = Utc::now();
        old.role = NodeRole::Replica;
        old.status = from_status;
        old.updated_at = now;
        self.nodes.put(&old)?;

        new.role = NodeRole::Primary;
        new.status = to_status;
        new.updated_at = now;
        self.nodes.put(&new)?;

        tracing::info!(
            cluster_id = %old.cluster_id,
            demoted = %old.id,
            promoted = %new.id,
            "primary transferred"
        );
        Ok((old, new))
    }

    /// Insert or replace a node as received from a peer.
    pub fn upsert_node(&self, node: &Node) -> RegistryResult<()> {
        let _guard = self.guard()?;
        self.nodes.put(node)?;
        Ok(())
    }

    /// Remove a node unless something still references it.
    pub fn remove_node(&self, id: Uuid, references: &dyn NodeReferences) -> RegistryResult<()> {
        if references.is_referenced(id)? {
            return Err(RegistryError::NodeInUse(id));
        }
        let _guard = self.guard()?;
        if !self.nodes.delete(&id.to_string())? {
            return Err(RegistryError::NodeNotFound(id));
        }
        Ok(())
    }

    // =========================================================================
    // LIFECYCLE EVENTS
    // =========================================================================

    /// Record a topology change against a node.
    pub fn record_event(
        &self,
        node_id: Uuid,
        kind: LifecycleKind,
        message: impl Into<String>,
        operation_id: Option<Uuid>,
    ) -> RegistryResult<NodeLifecycleEvent> {
        let event = NodeLifecycleEvent {
            id: Uuid::new_v4(),
            node_id,
            kind,
            message: message.into(),
            operation_id,
            recorded_at: Utc::now(),
        };
        self.events.put(&event)?;
        Ok(event)
    }

    /// Lifecycle events for a node, oldest first.
    pub fn events_for(&self, node_id: Uuid) -> RegistryResult<Vec<NodeLifecycleEvent>> {
        let mut events = self
            .events
            .find(&|e: &NodeLifecycleEvent| e.node_id == node_id)?;
        events.sort_by_key(|e| e.recorded_at);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRefs;
    impl NodeReferences for NoRefs {
        fn is_referenced(&self, _node_id: Uuid) -> RegistryResult<bool> {
            Ok(false)
        }
    }

    struct AllRefs;
    impl NodeReferences for AllRefs {
        fn is_referenced(&self, _node_id: Uuid) -> RegistryResult<bool> {
            Ok(true)
        }
    }

    fn cluster_with_pair(registry: &NodeRegistry) -> (Cluster, Node, Node) {
        let cluster = registry.create_cluster("orders").unwrap();
        let primary = registry
            .register_node(Node::new(cluster.id, "pg-a", "10.0.0.1", 5432, NodeRole::Primary))
            .unwrap();
        let replica = registry
            .register_node(Node::new(cluster.id, "pg-b", "10.0.0.2", 5432, NodeRole::Replica))
            .unwrap();
        (cluster, primary, replica)
    }

    #[test]
    fn test_second_primary_rejected() {
        let registry = NodeRegistry::in_memory();
        let (cluster, primary, _) = cluster_with_pair(&registry);

        let err = registry
            .register_node(Node::new(cluster.id, "pg-c", "10.0.0.3", 5432, NodeRole::Primary))
            .unwrap_err();
        match err {
            RegistryError::PrimaryExists { existing, .. } => assert_eq!(existing, primary.id),
            other => panic!("expected PrimaryExists, got {other:?}"),
        }
    }

    #[test]
    fn test_register_requires_cluster() {
        let registry = NodeRegistry::in_memory();
        let err = registry
            .register_node(Node::new(Uuid::new_v4(), "pg", "h", 5432, NodeRole::Replica))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ClusterNotFound(_)));
    }

    #[test]
    fn test_transfer_primary_is_idempotent() {
        let registry = NodeRegistry::in_memory();
        let (cluster, primary, replica) = cluster_with_pair(&registry);

        for _ in 0..2 {
            registry
                .transfer_primary(primary.id, NodeStatus::Offline, replica.id, NodeStatus::Online)
                .unwrap();
        }

        let old = registry.get_node(primary.id).unwrap();
        let new = registry.get_node(replica.id).unwrap();
        assert_eq!((old.role, old.status), (NodeRole::Replica, NodeStatus::Offline));
        assert_eq!((new.role, new.status), (NodeRole::Primary, NodeStatus::Online));
        assert_eq!(registry.primary_of(cluster.id).unwrap().unwrap().id, replica.id);
    }

    #[test]
    fn test_remove_node_respects_references() {
        let registry = NodeRegistry::in_memory();
        let (_, _, replica) = cluster_with_pair(&registry);

        assert!(matches!(
            registry.remove_node(replica.id, &AllRefs),
            Err(RegistryError::NodeInUse(_))
        ));
        registry.remove_node(replica.id, &NoRefs).unwrap();
        assert!(matches!(
            registry.get_node(replica.id),
            Err(RegistryError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_events_for_node() {
        let registry = NodeRegistry::in_memory();
        let (_, primary, _) = cluster_with_pair(&registry);

        registry
            .record_event(primary.id, LifecycleKind::Demoted, "demoted", None)
            .unwrap();
        let events = registry.events_for(primary.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LifecycleKind::Demoted);
    }
}
