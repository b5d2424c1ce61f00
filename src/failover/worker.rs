//! Failover execution worker.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::errors::FailoverResult;
use super::orchestrator::FailoverOrchestrator;

/// Consumes accepted operation ids and runs them.
///
/// Each operation runs on its own task; the per-cluster lock inside the
/// orchestrator serializes operations on the same cluster.
pub struct FailoverWorker {
    orchestrator: Arc<FailoverOrchestrator>,
    rx: UnboundedReceiver<Uuid>,
}

impl FailoverWorker {
    /// Create a worker and attach its queue to `orchestrator`.
    pub fn new(orchestrator: Arc<FailoverOrchestrator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        orchestrator.attach_queue(tx);
        Self { orchestrator, rx }
    }

    /// Re-enqueue operations left running by a previous process.
    pub fn resume_interrupted(&self) -> FailoverResult<usize> {
        let interrupted = self.orchestrator.interrupted()?;
        for op in &interrupted {
            tracing::info!(
                operation_id = %op.id,
                status = %op.status,
                current_step = ?op.current_step,
                "resuming interrupted failover"
            );
            self.orchestrator.enqueue(op.id);
        }
        Ok(interrupted.len())
    }

    /// Process the queue until every sender is gone.
    pub async fn run(mut self) {
        while let Some(id) = self.rx.recv().await {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                match orchestrator.run(id).await {
                    Ok(op) => tracing::info!(operation_id = %id, status = %op.status, "failover run finished"),
                    Err(err) => tracing::error!(operation_id = %id, error = %err, "failover run aborted"),
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::config::FailoverConfig;
    use crate::failover::{CreateFailover, FailoverStatus, FailoverType};
    use crate::pg::{FakeFleet, StaticCredentials};
    use crate::registry::{Node, NodeRegistry, NodeRole};
    use crate::store::MemoryRepository;
    use std::time::Duration;

    #[tokio::test]
    async fn test_worker_runs_executed_operation() {
        let registry = Arc::new(NodeRegistry::in_memory());
        let cluster = registry.create_cluster("c").unwrap();
        let a = registry
            .register_node(Node::new(cluster.id, "a", "10.0.0.1", 5432, NodeRole::Primary))
            .unwrap();
        let b = registry
            .register_node(Node::new(cluster.id, "b", "10.0.0.2", 5432, NodeRole::Replica))
            .unwrap();
        let fleet = Arc::new(FakeFleet::new());
        fleet.add_node(&a, "pw");
        fleet.add_node(&b, "pw");

        let orchestrator = Arc::new(FailoverOrchestrator::new(
            registry,
            Arc::new(MemoryRepository::new()),
            fleet,
            Arc::new(StaticCredentials::new("postgres", "pw")),
            Arc::new(MemoryAuditLog::new()),
            FailoverConfig::default(),
        ));
        let worker = FailoverWorker::new(orchestrator.clone());
        assert_eq!(worker.resume_interrupted().unwrap(), 0);
        let handle = worker.spawn();

        let op = orchestrator
            .create(
                CreateFailover {
                    cluster_id: cluster.id,
                    source_node_id: a.id,
                    target_node_id: b.id,
                    failover_type: FailoverType::Unplanned,
                    reason: None,
                },
                "alice",
            )
            .await
            .unwrap();
        orchestrator.execute(op.id, "alice", false).await.unwrap();

        let mut status = FailoverStatus::PreCheck;
        for _ in 0..100 {
            status = orchestrator.get(op.id).unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, FailoverStatus::Completed);
        handle.abort();
    }
}
