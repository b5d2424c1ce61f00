//! Federation data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::fingerprint;
use crate::store::Entity;

/// Key of the singleton identity record.
pub const IDENTITY_KEY: &str = "self";

/// This instance's role in its federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityRole {
    Principle,
    Partner,
    Standalone,
}

impl fmt::Display for IdentityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityRole::Principle => write!(f, "PRINCIPLE"),
            IdentityRole::Partner => write!(f, "PARTNER"),
            IdentityRole::Standalone => write!(f, "STANDALONE"),
        }
    }
}

/// Who this instance is. One per instance, created on first access.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneIdentity {
    pub instance_id: Uuid,
    pub name: String,
    pub domain: String,
    pub role: IdentityRole,
    /// Set iff `role` is PARTNER.
    pub principle_id: Option<Uuid>,
    pub api_key: String,
    /// Bumped on every principle-role change.
    #[serde(default)]
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ControlPlaneIdentity {
    /// Identity without the raw API key.
    pub fn view(&self) -> IdentityView {
        IdentityView {
            instance_id: self.instance_id,
            name: self.name.clone(),
            domain: self.domain.clone(),
            role: self.role,
            principle_id: self.principle_id,
            epoch: self.epoch,
            api_key_fingerprint: fingerprint(&self.api_key),
        }
    }
}

impl fmt::Debug for ControlPlaneIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlaneIdentity")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("role", &self.role)
            .field("principle_id", &self.principle_id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Entity for ControlPlaneIdentity {
    const KIND: &'static str = "federation_identity";

    fn key(&self) -> String {
        IDENTITY_KEY.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub instance_id: Uuid,
    pub name: String,
    pub domain: String,
    pub role: IdentityRole,
    pub principle_id: Option<Uuid>,
    pub epoch: u64,
    pub api_key_fingerprint: String,
}

/// A peer's role relative to this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerRole {
    Principle,
    Partner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Pending,
    Connected,
    Syncing,
    Disconnected,
}

/// Local record of a peer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedNode {
    /// Local record id.
    pub id: Uuid,
    /// Unknown until the peer answers our partnership request.
    pub instance_id: Option<Uuid>,
    pub name: Option<String>,
    pub domain: String,
    pub role: PeerRole,
    pub status: PeerStatus,
    pub sync_enabled: bool,
    /// SHA-256 of the key the peer presents.
    pub api_key_hash: Option<String>,
    /// Highest epoch seen from this peer.
    #[serde(default)]
    pub epoch: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub promotion_request_at: Option<DateTime<Utc>>,
    pub promotion_request_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl FederatedNode {
    pub fn new(domain: impl Into<String>, role: PeerRole, status: PeerStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id: None,
            name: None,
            domain: domain.into(),
            role,
            status,
            sync_enabled: false,
            api_key_hash: None,
            epoch: 0,
            last_heartbeat: None,
            promotion_request_at: None,
            promotion_request_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn clear_promotion_request(&mut self) {
        self.promotion_request_at = None;
        self.promotion_request_by = None;
    }
}

impl Entity for FederatedNode {
    const KIND: &'static str = "federated_nodes";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Partnership,
    Promotion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Acknowledged,
    Rejected,
}

/// A negotiation record, outgoing (ours) or incoming (a peer's).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationRequest {
    pub id: Uuid,
    pub from_instance_id: Uuid,
    pub from_name: String,
    pub from_domain: String,
    pub to_instance_id: Option<Uuid>,
    pub to_domain: Option<String>,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub message: Option<String>,
    /// Only set for PROMOTION.
    pub expires_at: Option<DateTime<Utc>>,
    /// Local FederatedNode the request concerns.
    pub node_id: Option<Uuid>,
    /// Requester's epoch when the request was made.
    #[serde(default)]
    pub epoch: u64,
    /// Hash of the key the requester will authenticate with.
    pub from_api_key_hash: Option<String>,
    /// How the request was resolved: accepted, rejected, timeout, superseded, expired.
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FederationRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at < now)
    }

    pub(crate) fn resolve(&mut self, status: RequestStatus, resolution: &str, now: DateTime<Utc>) {
        self.status = status;
        self.resolution = Some(resolution.to_string());
        self.resolved_at = Some(now);
    }
}

impl Entity for FederationRequest {
    const KIND: &'static str = "federation_requests";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    InProgress,
    Completed,
    Failed,
}

/// One sync run with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: Uuid,
    pub node_id: Uuid,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub records: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Entity for SyncLog {
    const KIND: &'static str = "sync_logs";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationStatus {
    pub identity: IdentityView,
    pub nodes: Vec<FederatedNode>,
    pub pending_requests: Vec<FederationRequest>,
}

/// Reply to a peer heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub instance_id: Uuid,
    pub role: IdentityRole,
    pub epoch: u64,
}

/// A request delivered by a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRequest {
    pub from_instance_id: Uuid,
    pub from_name: String,
    pub from_domain: String,
    pub request_type: RequestType,
    #[serde(default)]
    pub message: Option<String>,
    /// Key the requester will present on later calls.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub epoch: u64,
}

/// A peer's answer to one of our outgoing partnership requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnershipAnswer {
    pub instance_id: Uuid,
    pub name: String,
    /// Domain our request was sent to.
    pub domain: String,
    pub accepted: bool,
    /// The answering principle's epoch after accepting.
    #[serde(default)]
    pub epoch: u64,
    /// Key the principle will present on later calls.
    #[serde(default)]
    pub api_key: Option<String>,
}
