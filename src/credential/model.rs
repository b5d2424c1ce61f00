//! Credential data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Entity;

/// Key of the singleton credential record.
pub const SUPERUSER_KEY: &str = "superuser";

/// Alert type raised when no known password works on a node.
pub const ALERT_NEEDS_REENROLLMENT: &str = "NEEDS_REENROLLMENT";

/// Who is asking, as established by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    #[serde(default)]
    pub mfa_verified: bool,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, mfa_verified: bool) -> Self {
        Self {
            user_id: user_id.into(),
            mfa_verified,
        }
    }

    /// The control plane's own background tasks.
    pub fn system() -> Self {
        Self::new("system", true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    Active,
    /// Rotated; nodes not yet confirmed.
    Syncing,
    /// At least one node accepts none of the known passwords.
    NeedsReenrollment,
}

/// The one superuser secret shared by every managed node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperuserCredential {
    pub id: Uuid,
    pub username: String,
    pub current_password: String,
    /// Superseded passwords, newest first.
    pub password_history: Vec<String>,
    pub rotation_interval_days: u32,
    pub last_rotated_at: DateTime<Utc>,
    pub next_rotation_at: DateTime<Utc>,
    pub status: CredentialStatus,
    pub created_at: DateTime<Utc>,
}

impl SuperuserCredential {
    /// Public view without any password material.
    pub fn view(&self) -> CredentialView {
        CredentialView {
            id: self.id,
            username: self.username.clone(),
            history_len: self.password_history.len(),
            rotation_interval_days: self.rotation_interval_days,
            last_rotated_at: self.last_rotated_at,
            next_rotation_at: self.next_rotation_at,
            status: self.status,
        }
    }
}

impl fmt::Debug for SuperuserCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperuserCredential")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("history_len", &self.password_history.len())
            .field("status", &self.status)
            .field("next_rotation_at", &self.next_rotation_at)
            .finish_non_exhaustive()
    }
}

impl Entity for SuperuserCredential {
    const KIND: &'static str = "credentials";

    fn key(&self) -> String {
        SUPERUSER_KEY.to_string()
    }
}

/// Credential as returned to callers and written to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialView {
    pub id: Uuid,
    pub username: String,
    pub history_len: usize,
    pub rotation_interval_days: u32,
    pub last_rotated_at: DateTime<Utc>,
    pub next_rotation_at: DateTime<Utc>,
    pub status: CredentialStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropagationStatus {
    Pending,
    Success,
    Failed,
    NeedsReenrollment,
}

/// Outcome of the latest propagation attempt to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPropagation {
    pub node_id: Uuid,
    pub credential_id: Uuid,
    pub status: PropagationStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub success_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// `current` or `history_{i}`.
    pub password_used: Option<String>,
}

impl CredentialPropagation {
    pub fn pending(credential_id: Uuid, node_id: Uuid) -> Self {
        Self {
            node_id,
            credential_id,
            status: PropagationStatus::Pending,
            last_attempt_at: None,
            success_at: None,
            error_message: None,
            password_used: None,
        }
    }
}

impl Entity for CredentialPropagation {
    const KIND: &'static str = "credential_propagations";

    fn key(&self) -> String {
        self.node_id.to_string()
    }
}

/// Node-scoped alert for manual follow-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialAlert {
    pub id: Uuid,
    pub node_id: Uuid,
    pub alert_type: String,
    pub message: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl Entity for CredentialAlert {
    const KIND: &'static str = "credential_alerts";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Aggregate result of `propagate_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationReport {
    pub credential_status: CredentialStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub needs_reenrollment: usize,
    /// One entry per node, ordered by node id.
    pub results: Vec<CredentialPropagation>,
}

/// Outcome of a scheduled rotation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationCheck {
    Rotated { credential: CredentialView },
    #[serde(rename_all = "camelCase")]
    NotDue { days_remaining: i64 },
}

/// Everything an operator needs to see about the credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatusView {
    pub credential: Option<CredentialView>,
    pub propagations: Vec<CredentialPropagation>,
    pub unresolved_alerts: Vec<CredentialAlert>,
}
