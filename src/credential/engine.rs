//! Credential Rotation & Propagation Engine
//!
//! Owns the single superuser credential. Rotation mints a new password and
//! keeps a bounded history of superseded ones; propagation walks every node,
//! trying the current password first and then the history, and repairs
//! nodes that still accept an older password.
//!
//! Node failures never fail a rotation. They are recorded per node, and
//! nodes that accept no known password raise one alert each.

use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::stream::{self, StreamExt};
use uuid::Uuid;

use super::errors::{CredentialError, CredentialResult};
use super::model::{
    Actor, CredentialAlert, CredentialPropagation, CredentialStatus, CredentialStatusView,
    CredentialView, PropagationReport, PropagationStatus, RotationCheck, SuperuserCredential,
    ALERT_NEEDS_REENROLLMENT, SUPERUSER_KEY,
};
use crate::audit::{self, AuditRecord, AuditSink};
use crate::config::CredentialConfig;
use crate::crypto::generate_password;
use crate::observability::LifecycleEvent;
use crate::pg::{with_timeout, ConnectParams, CredentialSource, NodeClient, SuperuserLogin};
use crate::registry::{Node, NodeRegistry};
use crate::store::{Repository, StoreError};

const AUDIT_ENTITY: &str = "superuser_credential";

/// Rotation and propagation of the superuser credential.
pub struct CredentialEngine {
    credentials: Arc<dyn Repository<SuperuserCredential>>,
    propagations: Arc<dyn Repository<CredentialPropagation>>,
    alerts: Arc<dyn Repository<CredentialAlert>>,
    registry: Arc<NodeRegistry>,
    client: Arc<dyn NodeClient>,
    audit: Arc<dyn AuditSink>,
    config: CredentialConfig,
    /// Serializes initialize, rotate and status aggregation.
    write_lock: tokio::sync::Mutex<()>,
    /// Held shared by propagation attempts and exclusively by rotation, so a
    /// rotation never lands between loading the password and saving the
    /// node's result.
    rotation_gate: tokio::sync::RwLock<()>,
    /// Makes alert dedup check-then-insert atomic.
    alert_lock: Mutex<()>,
}

impl CredentialEngine {
    pub fn new(
        credentials: Arc<dyn Repository<SuperuserCredential>>,
        propagations: Arc<dyn Repository<CredentialPropagation>>,
        alerts: Arc<dyn Repository<CredentialAlert>>,
        registry: Arc<NodeRegistry>,
        client: Arc<dyn NodeClient>,
        audit: Arc<dyn AuditSink>,
        config: CredentialConfig,
    ) -> Self {
        Self {
            credentials,
            propagations,
            alerts,
            registry,
            client,
            audit,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            rotation_gate: tokio::sync::RwLock::new(()),
            alert_lock: Mutex::new(()),
        }
    }

    fn require_mfa(actor: &Actor) -> CredentialResult<()> {
        if actor.mfa_verified {
            Ok(())
        } else {
            Err(CredentialError::MfaRequired)
        }
    }

    fn load(&self) -> CredentialResult<SuperuserCredential> {
        self.credentials
            .get(SUPERUSER_KEY)?
            .ok_or(CredentialError::NotInitialized)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Create the credential. Fails if one already exists.
    pub async fn initialize(&self, actor: &Actor) -> CredentialResult<CredentialView> {
        Self::require_mfa(actor)?;
        let _guard = self.write_lock.lock().await;
        if self.credentials.get(SUPERUSER_KEY)?.is_some() {
            audit::record(
                &*self.audit,
                AuditRecord::new(&actor.user_id, AUDIT_ENTITY, SUPERUSER_KEY, "CREDENTIAL_INITIALIZE")
                    .rejected(CredentialError::AlreadyInitialized),
            );
            return Err(CredentialError::AlreadyInitialized);
        }

        let now = Utc::now();
        let interval = self.config.rotation_interval_days;
        let credential = SuperuserCredential {
            id: Uuid::new_v4(),
            username: self.config.username.clone(),
            current_password: generate_password(self.config.password_length),
            password_history: Vec::new(),
            rotation_interval_days: interval,
            last_rotated_at: now,
            next_rotation_at: now + ChronoDuration::days(i64::from(interval)),
            status: CredentialStatus::Active,
            created_at: now,
        };
        self.credentials.put(&credential)?;

        let view = credential.view();
        LifecycleEvent::CredentialInitialized.emit(credential.id, &credential.username);
        audit::record(
            &*self.audit,
            AuditRecord::new(&actor.user_id, AUDIT_ENTITY, credential.id, "CREDENTIAL_INITIALIZE")
                .after(&view),
        );
        Ok(view)
    }

    /// Mint a new password and reset every node to PENDING.
    ///
    /// The superseded password becomes `password_history[0]`; the history
    /// keeps at most `history_limit` entries.
    pub async fn rotate(&self, actor: &Actor) -> CredentialResult<CredentialView> {
        Self::require_mfa(actor)?;
        let _guard = self.write_lock.lock().await;
        let _gate = self.rotation_gate.write().await;
        self.rotate_locked(actor).await
    }

    async fn rotate_locked(&self, actor: &Actor) -> CredentialResult<CredentialView> {
        let mut credential = match self.load() {
            Ok(credential) => credential,
            Err(err) => {
                audit::record(
                    &*self.audit,
                    AuditRecord::new(&actor.user_id, AUDIT_ENTITY, SUPERUSER_KEY, "CREDENTIAL_ROTATE")
                        .failed(&err),
                );
                return Err(err);
            }
        };
        let before = credential.view();

        let now = Utc::now();
        let previous = std::mem::replace(
            &mut credential.current_password,
            generate_password(self.config.password_length),
        );
        credential.password_history.insert(0, previous);
        credential.password_history.truncate(self.config.history_limit);
        credential.last_rotated_at = now;
        credential.next_rotation_at =
            now + ChronoDuration::days(i64::from(credential.rotation_interval_days));
        credential.status = CredentialStatus::Syncing;
        self.credentials.put(&credential)?;

        for node in self.registry.all_nodes()? {
            let mut row = self
                .propagations
                .get(&node.id.to_string())?
                .unwrap_or_else(|| CredentialPropagation::pending(credential.id, node.id));
            row.credential_id = credential.id;
            row.status = PropagationStatus::Pending;
            row.error_message = None;
            row.password_used = None;
            self.propagations.put(&row)?;
        }

        let view = credential.view();
        LifecycleEvent::CredentialRotated.emit(credential.id, &format!("history={}", view.history_len));
        audit::record(
            &*self.audit,
            AuditRecord::new(&actor.user_id, AUDIT_ENTITY, credential.id, "CREDENTIAL_ROTATE")
                .before(&before)
                .after(&view),
        );
        Ok(view)
    }

    /// Rotate when the interval has elapsed.
    ///
    /// A due credential always rotates. A credential that is not yet due
    /// rotates only with `force`; otherwise the days remaining are reported.
    pub async fn check_rotation(&self, actor: &Actor, force: bool) -> CredentialResult<RotationCheck> {
        Self::require_mfa(actor)?;
        let _guard = self.write_lock.lock().await;
        let credential = self.load()?;

        let _gate = self.rotation_gate.write().await;
        let elapsed = (Utc::now() - credential.last_rotated_at).num_days();
        let interval = i64::from(credential.rotation_interval_days);
        if elapsed < interval && !force {
            return Ok(RotationCheck::NotDue {
                days_remaining: interval - elapsed,
            });
        }
        let credential = self.rotate_locked(actor).await?;
        Ok(RotationCheck::Rotated { credential })
    }

    // =========================================================================
    // PROPAGATION
    // =========================================================================

    /// Bring one node in line with the current password.
    pub async fn propagate(
        &self,
        actor: &Actor,
        node_id: Uuid,
    ) -> CredentialResult<CredentialPropagation> {
        Self::require_mfa(actor)?;
        let node = self.registry.get_node(node_id)?;
        let result = {
            let _gate = self.rotation_gate.read().await;
            let credential = self.load()?;
            self.propagate_node(&credential, &node).await?
        };

        audit::record(&*self.audit, self.propagation_record(actor, &result));
        Ok(result)
    }

    /// Propagate to every registered node and aggregate the outcome.
    ///
    /// Nodes are contacted with bounded concurrency; results are ordered by
    /// node id regardless of completion order. Rotation waits until the
    /// fan-out has finished.
    pub async fn propagate_all(&self, actor: &Actor) -> CredentialResult<PropagationReport> {
        Self::require_mfa(actor)?;
        let nodes = self.registry.all_nodes()?;

        let gate = self.rotation_gate.read().await;
        let credential = Arc::new(self.load()?);
        let outcomes: Vec<CredentialResult<CredentialPropagation>> = stream::iter(nodes)
            .map(|node| {
                let credential = Arc::clone(&credential);
                async move { self.propagate_node(&credential, &node).await }
            })
            .buffer_unordered(self.config.propagation_concurrency.max(1))
            .collect()
            .await;
        drop(gate);
        let mut results = outcomes.into_iter().collect::<CredentialResult<Vec<_>>>()?;
        results.sort_by_key(|r| r.node_id);

        let count = |status: PropagationStatus| results.iter().filter(|r| r.status == status).count();
        let succeeded = count(PropagationStatus::Success);
        let failed = count(PropagationStatus::Failed);
        let needs_reenrollment = count(PropagationStatus::NeedsReenrollment);
        let status = if needs_reenrollment > 0 {
            CredentialStatus::NeedsReenrollment
        } else {
            CredentialStatus::Active
        };

        {
            let _guard = self.write_lock.lock().await;
            let mut latest = self.load()?;
            // A rotation that landed meanwhile owns the status.
            if latest.current_password == credential.current_password {
                let before = latest.view();
                latest.status = status;
                self.credentials.put(&latest)?;
                audit::record(
                    &*self.audit,
                    AuditRecord::new(&actor.user_id, AUDIT_ENTITY, latest.id, "CREDENTIAL_PROPAGATE_ALL")
                        .before(&before)
                        .after(&latest.view()),
                );
            }
        }

        LifecycleEvent::PropagationFinished.emit(
            credential.id,
            &format!(
                "succeeded={} failed={} needs_reenrollment={}",
                succeeded, failed, needs_reenrollment
            ),
        );
        Ok(PropagationReport {
            credential_status: status,
            succeeded,
            failed,
            needs_reenrollment,
            results,
        })
    }

    /// Try `[current, history...]` against one node and persist the outcome.
    ///
    /// Callers hold `rotation_gate` for reading.
    async fn propagate_node(
        &self,
        credential: &SuperuserCredential,
        node: &Node,
    ) -> CredentialResult<CredentialPropagation> {
        let timeout = self.config.node_timeout();
        let login = SuperuserLogin {
            username: credential.username.clone(),
            password: credential.current_password.clone(),
            ssl: self.config.ssl,
        };
        let now = Utc::now();
        let mut row = self
            .propagations
            .get(&node.id.to_string())?
            .unwrap_or_else(|| CredentialPropagation::pending(credential.id, node.id));
        row.credential_id = credential.id;
        row.last_attempt_at = Some(now);

        let candidates = std::iter::once(&credential.current_password)
            .chain(credential.password_history.iter());

        let mut accepted = None;
        for (i, password) in candidates.enumerate() {
            let params = ConnectParams::with_password(node, &login, password);
            match with_timeout(timeout, params.address(), self.client.authenticate(&params)).await {
                Ok(()) => {
                    accepted = Some((i, params));
                    break;
                }
                Err(err) if err.is_auth_failure() => continue,
                Err(err) => {
                    tracing::warn!(node_id = %node.id, address = %node.address(), error = %err, "propagation attempt failed");
                    row.status = PropagationStatus::Failed;
                    row.error_message = Some(err.to_string());
                    row.password_used = None;
                    self.propagations.put(&row)?;
                    return Ok(row);
                }
            }
        }

        match accepted {
            Some((0, _)) => {
                row.status = PropagationStatus::Success;
                row.success_at = Some(now);
                row.error_message = None;
                row.password_used = Some("current".into());
            }
            Some((i, params)) => {
                let label = format!("history_{}", i - 1);
                let changed = with_timeout(
                    timeout,
                    params.address(),
                    self.client
                        .set_password(&params, &credential.username, &credential.current_password),
                )
                .await;
                match changed {
                    Ok(()) => {
                        tracing::info!(node_id = %node.id, password_used = %label, "node password updated");
                        row.status = PropagationStatus::Success;
                        row.success_at = Some(now);
                        row.error_message = None;
                    }
                    Err(err) => {
                        row.status = PropagationStatus::Failed;
                        row.error_message = Some(format!(
                            "Connected with {} but could not update password: {}",
                            label, err
                        ));
                    }
                }
                row.password_used = Some(label);
            }
            None => {
                row.status = PropagationStatus::NeedsReenrollment;
                row.error_message = Some(format!(
                    "None of the {} known passwords were accepted by {}",
                    credential.password_history.len() + 1,
                    node.address()
                ));
                row.password_used = None;
                self.raise_reenrollment_alert(node)?;
            }
        }

        self.propagations.put(&row)?;
        Ok(row)
    }

    /// Create a re-enrollment alert unless one is already open for the node.
    fn raise_reenrollment_alert(&self, node: &Node) -> CredentialResult<()> {
        let _guard = self
            .alert_lock
            .lock()
            .map_err(|_| CredentialError::Store(StoreError::Poisoned))?;
        let open = self.alerts.find(&|a: &CredentialAlert| {
            a.node_id == node.id && a.alert_type == ALERT_NEEDS_REENROLLMENT && !a.resolved
        })?;
        if !open.is_empty() {
            return Ok(());
        }

        let alert = CredentialAlert {
            id: Uuid::new_v4(),
            node_id: node.id,
            alert_type: ALERT_NEEDS_REENROLLMENT.to_string(),
            message: format!(
                "Node {} ({}) rejects every known superuser password and must be re-enrolled manually",
                node.name,
                node.address()
            ),
            resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };
        self.alerts.put(&alert)?;
        LifecycleEvent::ReenrollmentRequired.emit(node.id, &node.address());
        Ok(())
    }

    fn propagation_record(&self, actor: &Actor, result: &CredentialPropagation) -> AuditRecord {
        let record = AuditRecord::new(&actor.user_id, "credential_propagation", result.node_id, "CREDENTIAL_PROPAGATE")
            .after(result);
        match (&result.status, &result.error_message) {
            (PropagationStatus::Success, _) => record,
            (_, Some(error)) => record.failed(error),
            (_, None) => record.failed(format!("{:?}", result.status)),
        }
    }

    // =========================================================================
    // ALERTS AND STATUS
    // =========================================================================

    /// Mark an alert resolved. Resolving twice is a no-op.
    pub fn resolve_alert(&self, actor: &Actor, alert_id: Uuid) -> CredentialResult<CredentialAlert> {
        Self::require_mfa(actor)?;
        let mut alert = self
            .alerts
            .get(&alert_id.to_string())?
            .ok_or(CredentialError::AlertNotFound(alert_id))?;
        if alert.resolved {
            return Ok(alert);
        }
        let before = alert.clone();
        alert.resolved = true;
        alert.resolved_at = Some(Utc::now());
        alert.resolved_by = Some(actor.user_id.clone());
        self.alerts.put(&alert)?;

        audit::record(
            &*self.audit,
            AuditRecord::new(&actor.user_id, "credential_alert", alert.id, "CREDENTIAL_ALERT_RESOLVE")
                .before(&before)
                .after(&alert),
        );
        Ok(alert)
    }

    /// Alerts, oldest first.
    pub fn alerts(&self, include_resolved: bool) -> CredentialResult<Vec<CredentialAlert>> {
        let mut alerts = self
            .alerts
            .find(&|a: &CredentialAlert| include_resolved || !a.resolved)?;
        alerts.sort_by_key(|a| a.created_at);
        Ok(alerts)
    }

    /// Credential without passwords, per-node propagation and open alerts.
    pub fn status(&self) -> CredentialResult<CredentialStatusView> {
        Ok(CredentialStatusView {
            credential: self.credentials.get(SUPERUSER_KEY)?.map(|c| c.view()),
            propagations: self.propagations.list()?,
            unresolved_alerts: self.alerts(false)?,
        })
    }
}

impl CredentialSource for CredentialEngine {
    fn superuser(&self) -> Option<SuperuserLogin> {
        match self.credentials.get(SUPERUSER_KEY) {
            Ok(credential) => credential.map(|c| SuperuserLogin {
                username: c.username,
                password: c.current_password,
                ssl: self.config.ssl,
            }),
            Err(err) => {
                tracing::error!(error = %err, "could not load superuser credential");
                None
            }
        }
    }
}
