//! Failover Orchestrator
//!
//! Creates failover operations with advisory pre-checks, accepts them for
//! execution, and drives the promotion of a replica against live Postgres.
//!
//! Execution is resumable. The operation record is saved with
//! `current_step` before each side effect and the step is appended to
//! `completed_steps` afterwards; a restarted process re-enqueues every
//! running operation and skips completed steps. Each step tolerates being
//! repeated.
//!
//! Non-responsibilities:
//! - Does not retry failed operations (operators create a new one)
//! - Does not reconfigure the old primary as a standby

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::errors::{FailoverError, FailoverResult};
use super::locks::ClusterLocks;
use super::operation::{ExecutionStep, FailoverOperation};
use super::prechecks::run_prechecks;
use super::state::{FailoverStatus, FailoverType};
use crate::audit::{self, AuditRecord, AuditSink};
use crate::config::FailoverConfig;
use crate::observability::LifecycleEvent;
use crate::pg::{
    with_timeout, ConnectParams, CredentialSource, NodeClient, ReplicationSlot, SuperuserLogin,
    WalActivity, SYSTEM_USERS,
};
use crate::registry::{LifecycleKind, Node, NodeReferences, NodeRegistry, NodeStatus, RegistryResult};
use crate::store::Repository;

const AUDIT_ENTITY: &str = "failover_operation";

/// Body of a create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFailover {
    pub cluster_id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    #[serde(rename = "type", default)]
    pub failover_type: FailoverType,
    #[serde(default)]
    pub reason: Option<String>,
}

/// WAL state of one node, read before choosing a promotion target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeWalReport {
    pub node_id: Uuid,
    pub address: String,
    pub activity: WalActivity,
    pub slots: Vec<ReplicationSlot>,
}

/// Coordinates failover operations for every cluster.
pub struct FailoverOrchestrator {
    registry: Arc<NodeRegistry>,
    operations: Arc<dyn Repository<FailoverOperation>>,
    client: Arc<dyn NodeClient>,
    credentials: Arc<dyn CredentialSource>,
    audit: Arc<dyn AuditSink>,
    config: FailoverConfig,
    locks: ClusterLocks,
    queue: OnceLock<UnboundedSender<Uuid>>,
}

impl FailoverOrchestrator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        operations: Arc<dyn Repository<FailoverOperation>>,
        client: Arc<dyn NodeClient>,
        credentials: Arc<dyn CredentialSource>,
        audit: Arc<dyn AuditSink>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            registry,
            operations,
            client,
            credentials,
            audit,
            config,
            locks: ClusterLocks::new(),
            queue: OnceLock::new(),
        }
    }

    /// Route accepted operations to a worker. Only the first call has effect.
    pub fn attach_queue(&self, queue: UnboundedSender<Uuid>) {
        if self.queue.set(queue).is_err() {
            tracing::warn!("failover queue already attached");
        }
    }

    /// Hand an operation id to the worker, if one is attached.
    pub(crate) fn enqueue(&self, id: Uuid) {
        match self.queue.get() {
            Some(queue) => {
                if queue.send(id).is_err() {
                    tracing::warn!(operation_id = %id, "failover worker stopped; operation stays resumable");
                }
            }
            None => tracing::debug!(operation_id = %id, "no failover worker attached"),
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn get(&self, id: Uuid) -> FailoverResult<FailoverOperation> {
        self.operations
            .get(&id.to_string())?
            .ok_or(FailoverError::NotFound(id))
    }

    /// Operations, optionally for one cluster, oldest first.
    pub fn list(&self, cluster_id: Option<Uuid>) -> FailoverResult<Vec<FailoverOperation>> {
        let mut ops = self
            .operations
            .find(&|op: &FailoverOperation| cluster_id.map_or(true, |c| op.cluster_id == c))?;
        ops.sort_by_key(|op| op.created_at);
        Ok(ops)
    }

    /// Operations accepted for execution that have not finished.
    pub fn interrupted(&self) -> FailoverResult<Vec<FailoverOperation>> {
        let mut ops = self
            .operations
            .find(&|op: &FailoverOperation| op.status.is_running())?;
        ops.sort_by_key(|op| op.created_at);
        Ok(ops)
    }

    /// Read the WAL position, streaming standbys and replication slots of a
    /// registered node.
    pub async fn inspect_node(&self, node_id: Uuid) -> FailoverResult<NodeWalReport> {
        let node = self.registry.get_node(node_id)?;
        let login = self.credentials.superuser().ok_or(FailoverError::NoCredential)?;
        let params = ConnectParams::for_node(&node, &login);
        let timeout = self.config.node_timeout();

        let activity =
            with_timeout(timeout, params.address(), self.client.wal_activity(&params)).await?;
        let slots =
            with_timeout(timeout, params.address(), self.client.replication_slots(&params)).await?;
        Ok(NodeWalReport {
            node_id: node.id,
            address: node.address(),
            activity,
            slots,
        })
    }

    // =========================================================================
    // OPERATOR ACTIONS
    // =========================================================================

    /// Validate the node pair, run pre-checks and persist a PENDING operation.
    ///
    /// Failing pre-checks are recorded on the operation and never block
    /// creation.
    pub async fn create(
        &self,
        request: CreateFailover,
        actor: &str,
    ) -> FailoverResult<FailoverOperation> {
        if request.source_node_id == request.target_node_id {
            return Err(FailoverError::Validation(
                "source and target must be different nodes".into(),
            ));
        }

        let _guard = self.locks.lock(request.cluster_id).await;
        self.registry.get_cluster(request.cluster_id)?;
        let source = self.node_in_cluster(request.source_node_id, request.cluster_id)?;
        let target = self.node_in_cluster(request.target_node_id, request.cluster_id)?;

        let active = self.operations.find(&|op: &FailoverOperation| {
            op.cluster_id == request.cluster_id && !op.status.is_terminal()
        })?;
        if let Some(existing) = active.first() {
            return Err(FailoverError::Conflict(format!(
                "failover already in progress for cluster ({})",
                existing.id
            )));
        }

        let login = self.credentials.superuser();
        let checks =
            run_prechecks(&*self.client, login.as_ref(), &source, &target, &self.config).await;

        let mut op = FailoverOperation::new(
            request.cluster_id,
            source.id,
            target.id,
            request.failover_type,
            request.reason,
            actor,
            checks,
        );
        let failed = op.failed_checks().len();
        op.log(format!(
            "Failover created by {}: {} -> {}",
            actor,
            source.address(),
            target.address()
        ));
        op.log(format!(
            "Pre-checks: {} of {} passed",
            op.pre_checks.len() - failed,
            op.pre_checks.len()
        ));
        self.save(&op)?;

        LifecycleEvent::FailoverCreated.emit(op.id, &format!("{} failed pre-checks", failed));
        audit::record(
            &*self.audit,
            AuditRecord::new(actor, AUDIT_ENTITY, op.id, "FAILOVER_CREATE").after(&op),
        );
        Ok(op)
    }

    /// Accept a PENDING operation for execution and hand it to the worker.
    ///
    /// With `enforce_pre_checks` set, failing checks refuse execution unless
    /// `force` is given.
    pub async fn execute(
        &self,
        id: Uuid,
        actor: &str,
        force: bool,
    ) -> FailoverResult<FailoverOperation> {
        let cluster_id = self.get(id)?.cluster_id;
        let op = {
            let _guard = self.locks.lock(cluster_id).await;
            let mut op = self.get(id)?;
            if op.status != FailoverStatus::Pending {
                return Err(FailoverError::InvalidState(
                    "Operation must be pending to execute".into(),
                ));
            }

            let failed: Vec<String> = op.failed_checks().iter().map(|c| c.name.clone()).collect();
            if !failed.is_empty() {
                if self.config.enforce_pre_checks && !force {
                    return Err(FailoverError::PreChecksFailed(failed));
                }
                op.log(format!(
                    "Proceeding despite failed pre-checks: {}",
                    failed.join(", ")
                ));
            }

            let before = op.clone();
            op.transition(FailoverStatus::PreCheck)?;
            op.log(format!("Execution requested by {}", actor));
            self.save(&op)?;
            audit::record(
                &*self.audit,
                AuditRecord::new(actor, AUDIT_ENTITY, op.id, "FAILOVER_EXECUTE")
                    .before(&before)
                    .after(&op),
            );
            op
        };

        self.enqueue(op.id);
        Ok(op)
    }

    /// Restore the pre-failover roles in the registry.
    ///
    /// With `compensate`, a COMPLETED operation also re-promotes the original
    /// source if it is in recovery. Compensation failures are logged on the
    /// operation and never abort the rollback.
    pub async fn rollback(
        &self,
        id: Uuid,
        actor: &str,
        compensate: bool,
    ) -> FailoverResult<FailoverOperation> {
        let cluster_id = self.get(id)?.cluster_id;
        let _guard = self.locks.lock(cluster_id).await;
        let mut op = self.get(id)?;
        if !matches!(op.status, FailoverStatus::Completed | FailoverStatus::Failed) {
            return Err(FailoverError::InvalidState(
                "Operation must be completed or failed to roll back".into(),
            ));
        }
        let before = op.clone();

        if compensate && op.status == FailoverStatus::Completed {
            self.compensate(&mut op).await;
        }

        self.registry.transfer_primary(
            op.target_node_id,
            NodeStatus::Online,
            op.source_node_id,
            NodeStatus::Online,
        )?;
        op.log("Rolled back: source restored as PRIMARY, target restored as REPLICA");
        op.transition(FailoverStatus::RolledBack)?;
        op.rolled_back_at = Some(Utc::now());
        self.save(&op)?;

        for node_id in [op.source_node_id, op.target_node_id] {
            self.record_lifecycle(node_id, LifecycleKind::RolledBack, "Failover rolled back", op.id);
        }
        LifecycleEvent::RolledBack.emit(op.id, if compensate { "compensated" } else { "bookkeeping" });
        audit::record(
            &*self.audit,
            AuditRecord::new(actor, AUDIT_ENTITY, op.id, "FAILOVER_ROLLBACK")
                .before(&before)
                .after(&op),
        );
        Ok(op)
    }

    /// Cancel a PENDING operation.
    pub async fn cancel(&self, id: Uuid, actor: &str) -> FailoverResult<FailoverOperation> {
        let cluster_id = self.get(id)?.cluster_id;
        let _guard = self.locks.lock(cluster_id).await;
        let mut op = self.get(id)?;
        if op.status != FailoverStatus::Pending {
            return Err(FailoverError::InvalidState(
                "Operation must be pending to cancel".into(),
            ));
        }
        let before = op.clone();
        op.transition(FailoverStatus::Failed)?;
        op.error = Some("Cancelled by user".into());
        op.log(format!("Cancelled by user {}", actor));
        op.completed_at = Some(Utc::now());
        self.save(&op)?;

        audit::record(
            &*self.audit,
            AuditRecord::new(actor, AUDIT_ENTITY, op.id, "FAILOVER_CANCEL")
                .before(&before)
                .after(&op),
        );
        Ok(op)
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Drive an accepted operation to COMPLETED or FAILED.
    ///
    /// Operations that are not running are returned unchanged, so a
    /// duplicate queue entry is harmless.
    pub async fn run(&self, id: Uuid) -> FailoverResult<FailoverOperation> {
        let cluster_id = self.get(id)?.cluster_id;
        let _guard = self.locks.lock(cluster_id).await;
        let mut op = self.get(id)?;
        if !op.status.is_running() {
            return Ok(op);
        }

        if let Err(err) = self.drive(&mut op).await {
            let step = op.current_step.take();
            tracing::error!(
                operation_id = %op.id,
                step = ?step,
                error = %err,
                "failover failed"
            );
            let before_failure = op.status;
            op.log(match step {
                Some(step) => format!("Failover failed during {}: {}", step, err),
                None => format!("Failover failed: {}", err),
            });
            op.error = Some(err.to_string());
            op.transition(FailoverStatus::Failed)?;
            op.completed_at = Some(Utc::now());
            self.save(&op)?;

            LifecycleEvent::FailoverFailed.emit(op.id, &err.to_string());
            audit::record(
                &*self.audit,
                AuditRecord::new("system", AUDIT_ENTITY, op.id, "FAILOVER_RUN")
                    .before(&serde_json::json!({ "status": before_failure }))
                    .after(&op)
                    .failed(&err),
            );
        }
        Ok(op)
    }

    async fn drive(&self, op: &mut FailoverOperation) -> FailoverResult<()> {
        let login = self.credentials.superuser().ok_or(FailoverError::NoCredential)?;
        let source = self.registry.get_node(op.source_node_id)?;
        let target = self.registry.get_node(op.target_node_id)?;

        if op.status == FailoverStatus::PreCheck {
            op.transition(FailoverStatus::InProgress)?;
            op.started_at = Some(Utc::now());
            op.log("Starting failover execution");
            self.save(op)?;
            LifecycleEvent::FailoverStarted.emit(op.id, &target.address());
        } else {
            op.log(format!("Resuming failover at status {}", op.status));
        }

        for step in ExecutionStep::ALL {
            if op.is_step_done(step) {
                continue;
            }
            op.current_step = Some(step);
            self.save(op)?;

            self.run_step(step, op, &source, &target, &login).await?;

            op.current_step = None;
            op.completed_steps.push(step);
            self.save(op)?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: ExecutionStep,
        op: &mut FailoverOperation,
        source: &Node,
        target: &Node,
        login: &SuperuserLogin,
    ) -> FailoverResult<()> {
        let timeout = self.config.node_timeout();
        let source_params = ConnectParams::for_node(source, login);
        let target_params = ConnectParams::for_node(target, login);

        match step {
            ExecutionStep::TerminateConnections => {
                let mut excluded: Vec<String> = SYSTEM_USERS.iter().map(|u| u.to_string()).collect();
                if !excluded.contains(&login.username) {
                    excluded.push(login.username.clone());
                }
                let result = with_timeout(
                    timeout,
                    source_params.address(),
                    self.client.terminate_backends(&source_params, &excluded),
                )
                .await;
                match result {
                    Ok(n) => op.log(format!(
                        "Terminated {} connections on source {}",
                        n,
                        source.address()
                    )),
                    Err(err) => {
                        tracing::warn!(operation_id = %op.id, error = %err, "could not terminate source connections");
                        op.log(format!(
                            "Warning: could not terminate connections on source: {}",
                            err
                        ));
                    }
                }
            }

            ExecutionStep::Promote => {
                let in_recovery = with_timeout(
                    timeout,
                    target_params.address(),
                    self.client.is_in_recovery(&target_params),
                )
                .await;
                if let Ok(false) = in_recovery {
                    op.log("Target already out of recovery; skipping pg_promote");
                    return Ok(());
                }

                // pg_promote waits on its own budget; the client bounds it.
                match self
                    .client
                    .promote(&target_params, true, self.config.promote_timeout_secs)
                    .await
                {
                    Ok(promoted) => op.log(format!(
                        "pg_promote on {} returned {}",
                        target.address(),
                        promoted
                    )),
                    Err(err) => {
                        tracing::warn!(operation_id = %op.id, error = %err, "pg_promote call failed");
                        op.log(format!("pg_promote call on {} failed: {}", target.address(), err));
                    }
                }
            }

            ExecutionStep::UpdateRegistry => {
                self.registry.transfer_primary(
                    source.id,
                    NodeStatus::Offline,
                    target.id,
                    NodeStatus::Online,
                )?;
                op.log(format!(
                    "Registry updated: {} -> REPLICA/OFFLINE, {} -> PRIMARY/ONLINE",
                    source.name, target.name
                ));
            }

            ExecutionStep::Validate => {
                if op.status == FailoverStatus::InProgress {
                    op.transition(FailoverStatus::Validating)?;
                    self.save(op)?;
                }
                let in_recovery = with_timeout(
                    timeout,
                    target_params.address(),
                    self.client.is_in_recovery(&target_params),
                )
                .await?;
                if in_recovery {
                    return Err(FailoverError::StillInRecovery);
                }
                op.log(format!("Validation passed: {} accepts writes", target.address()));
                match with_timeout(
                    timeout,
                    target_params.address(),
                    self.client.current_wal_lsn(&target_params),
                )
                .await
                {
                    Ok(lsn) => op.log(format!("Target accepting writes at WAL position {}", lsn)),
                    Err(err) => {
                        tracing::warn!(operation_id = %op.id, error = %err, "could not read target WAL position");
                        op.log(format!("Warning: could not read WAL position on target: {}", err));
                    }
                }
            }

            ExecutionStep::Finalize => {
                op.log(format!(
                    "Old primary {} requires manual reconfiguration as a standby",
                    source.address()
                ));
                op.transition(FailoverStatus::Completed)?;
                op.completed_at = Some(Utc::now());
                self.save(op)?;

                self.record_lifecycle(source.id, LifecycleKind::Demoted, "Demoted by failover", op.id);
                self.record_lifecycle(target.id, LifecycleKind::Promoted, "Promoted by failover", op.id);
                LifecycleEvent::Demoted.emit_for_node(source.id, op.id);
                LifecycleEvent::Promoted.emit_for_node(target.id, op.id);
                LifecycleEvent::FailoverCompleted.emit(op.id, &target.address());
                audit::record(
                    &*self.audit,
                    AuditRecord::new("system", AUDIT_ENTITY, op.id, "FAILOVER_COMPLETE").after(&*op),
                );
            }
        }
        Ok(())
    }

    /// Best-effort compensating promotion of the original source.
    async fn compensate(&self, op: &mut FailoverOperation) {
        let Some(login) = self.credentials.superuser() else {
            op.log("Compensation skipped: no superuser credential configured");
            return;
        };
        let source = match self.registry.get_node(op.source_node_id) {
            Ok(node) => node,
            Err(err) => {
                op.log(format!("Compensation skipped: {}", err));
                return;
            }
        };
        let params = ConnectParams::for_node(&source, &login);
        let timeout = self.config.node_timeout();

        match with_timeout(timeout, params.address(), self.client.is_in_recovery(&params)).await {
            Ok(true) => {
                match self
                    .client
                    .promote(&params, true, self.config.promote_timeout_secs)
                    .await
                {
                    Ok(promoted) => op.log(format!(
                        "Compensation: pg_promote on {} returned {}",
                        source.address(),
                        promoted
                    )),
                    Err(err) => op.log(format!(
                        "Compensation: pg_promote on {} failed: {}",
                        source.address(),
                        err
                    )),
                }
            }
            Ok(false) => op.log(format!(
                "Compensation: {} already accepts writes",
                source.address()
            )),
            Err(err) => op.log(format!(
                "Compensation skipped: {} unreachable: {}",
                source.address(),
                err
            )),
        }
        op.log("Former target must be re-based as a standby of the restored primary");
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn save(&self, op: &FailoverOperation) -> FailoverResult<()> {
        self.operations.put(op)?;
        Ok(())
    }

    fn node_in_cluster(&self, node_id: Uuid, cluster_id: Uuid) -> FailoverResult<Node> {
        let node = self.registry.get_node(node_id)?;
        if node.cluster_id != cluster_id {
            return Err(FailoverError::Validation(format!(
                "node {} does not belong to cluster {}",
                node_id, cluster_id
            )));
        }
        Ok(node)
    }

    fn record_lifecycle(&self, node_id: Uuid, kind: LifecycleKind, message: &str, op_id: Uuid) {
        if let Err(err) = self.registry.record_event(node_id, kind, message, Some(op_id)) {
            tracing::warn!(node_id = %node_id, error = %err, "could not record lifecycle event");
        }
    }
}

impl NodeReferences for FailoverOrchestrator {
    fn is_referenced(&self, node_id: Uuid) -> RegistryResult<bool> {
        Ok(!self
            .operations
            .find(&|op: &FailoverOperation| op.references(node_id))?
            .is_empty())
    }
}
