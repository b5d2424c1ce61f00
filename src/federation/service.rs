//! Federation Protocol
//!
//! Each instance keeps its own view of the federation and reconciles
//! optimistically; there is no global arbiter. Role state machine:
//!
//! ```text
//! STANDALONE -> PRINCIPLE   accept incoming PARTNERSHIP
//! STANDALONE -> PARTNER     accept incoming PROMOTION
//! PRINCIPLE  -> PARTNER     accept incoming PROMOTION, or promote_partner
//! PARTNER    -> PRINCIPLE   own PROMOTION request expires, or accept_resignation
//! any        -> STANDALONE  disconnect from our principle
//! ```
//!
//! Every principle-role change bumps the identity epoch. Requests carry the
//! requester's epoch, so one that lost a race against a newer assignment is
//! rejected as superseded instead of overwriting it. Heartbeats only move our
//! epoch when they come from our own principle, and peer-supplied epochs are
//! bounded so the counter never wraps. All role transitions run under one
//! guard.

use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use uuid::Uuid;

use super::errors::{FederationError, FederationResult};
use super::model::{
    ControlPlaneIdentity, FederatedNode, FederationRequest, FederationStatus, HeartbeatAck,
    IdentityRole, IncomingRequest, PartnershipAnswer, PeerRole, PeerStatus, RequestStatus, RequestType, SyncDirection,
    SyncLog, SyncStatus, IDENTITY_KEY,
};
use super::transport::{SyncSnapshot, SyncTransport};
use crate::audit::{self, AuditRecord, AuditSink};
use crate::config::FederationConfig;
use crate::crypto::{constant_time_str_eq, generate_token, hash_secret};
use crate::observability::LifecycleEvent;
use crate::registry::NodeRegistry;
use crate::store::{Repository, StoreError};

const DOMAIN_PATTERN: &str =
    r"^(localhost|[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+)(:[0-9]{1,5})?$";

/// Largest step a peer-supplied epoch may take past our own.
const MAX_EPOCH_STEP: u64 = 1 << 16;

/// `epoch + 1`, refusing to wrap.
fn next_epoch(epoch: u64) -> FederationResult<u64> {
    epoch
        .checked_add(1)
        .ok_or(FederationError::EpochOutOfRange { epoch, current: epoch })
}

/// A peer-supplied epoch, unless it runs implausibly far ahead of `current`.
fn peer_epoch(epoch: u64, current: u64) -> FederationResult<u64> {
    if epoch > current.saturating_add(MAX_EPOCH_STEP) {
        return Err(FederationError::EpochOutOfRange { epoch, current });
    }
    Ok(epoch)
}

fn valid_domain(domain: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DOMAIN_PATTERN).ok())
        .as_ref()
        .map_or(false, |re| re.is_match(domain))
}

/// Federation identity, negotiation and sync.
pub struct FederationService {
    identity: Arc<dyn Repository<ControlPlaneIdentity>>,
    peers: Arc<dyn Repository<FederatedNode>>,
    requests: Arc<dyn Repository<FederationRequest>>,
    sync_logs: Arc<dyn Repository<SyncLog>>,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn SyncTransport>,
    audit: Arc<dyn AuditSink>,
    config: FederationConfig,
    /// Guards identity-role transitions.
    guard: tokio::sync::Mutex<()>,
    /// Guards lazy identity creation.
    init_lock: Mutex<()>,
}

impl FederationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<dyn Repository<ControlPlaneIdentity>>,
        peers: Arc<dyn Repository<FederatedNode>>,
        requests: Arc<dyn Repository<FederationRequest>>,
        sync_logs: Arc<dyn Repository<SyncLog>>,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn SyncTransport>,
        audit: Arc<dyn AuditSink>,
        config: FederationConfig,
    ) -> Self {
        Self {
            identity,
            peers,
            requests,
            sync_logs,
            registry,
            transport,
            audit,
            config,
            guard: tokio::sync::Mutex::new(()),
            init_lock: Mutex::new(()),
        }
    }

    // =========================================================================
    // IDENTITY
    // =========================================================================

    /// This instance's identity, created as STANDALONE on first access.
    pub fn identity(&self) -> FederationResult<ControlPlaneIdentity> {
        if let Some(identity) = self.identity.get(IDENTITY_KEY)? {
            return Ok(identity);
        }
        let _lock = self
            .init_lock
            .lock()
            .map_err(|_| FederationError::Store(StoreError::Poisoned))?;
        if let Some(identity) = self.identity.get(IDENTITY_KEY)? {
            return Ok(identity);
        }

        let now = Utc::now();
        let identity = ControlPlaneIdentity {
            instance_id: Uuid::new_v4(),
            name: self.config.instance_name.clone(),
            domain: self.config.domain.clone(),
            role: IdentityRole::Standalone,
            principle_id: None,
            api_key: generate_token(),
            epoch: 0,
            created_at: now,
            updated_at: now,
        };
        self.identity.put(&identity)?;
        tracing::info!(instance_id = %identity.instance_id, "federation identity created");
        Ok(identity)
    }

    fn save_identity(&self, identity: &mut ControlPlaneIdentity) -> FederationResult<()> {
        identity.updated_at = Utc::now();
        self.identity.put(identity)?;
        Ok(())
    }

    /// Change name and/or domain.
    pub async fn update_identity(
        &self,
        actor: &str,
        name: Option<String>,
        domain: Option<String>,
    ) -> FederationResult<ControlPlaneIdentity> {
        let _guard = self.guard.lock().await;
        let mut identity = self.identity()?;
        let before = identity.view();

        if let Some(name) = name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(FederationError::Validation("name is empty".into()));
            }
            identity.name = name;
        }
        if let Some(domain) = domain {
            if !valid_domain(&domain) {
                return Err(FederationError::Validation(format!("invalid domain: {}", domain)));
            }
            identity.domain = domain;
        }
        self.save_identity(&mut identity)?;

        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federation_identity", identity.instance_id, "IDENTITY_UPDATE")
                .before(&before)
                .after(&identity.view()),
        );
        Ok(identity)
    }

    /// Replace the API key peers use to reach this instance.
    pub async fn regenerate_api_key(&self, actor: &str) -> FederationResult<ControlPlaneIdentity> {
        let _guard = self.guard.lock().await;
        let mut identity = self.identity()?;
        let before = identity.view();
        identity.api_key = generate_token();
        self.save_identity(&mut identity)?;

        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federation_identity", identity.instance_id, "API_KEY_REGENERATE")
                .before(&before)
                .after(&identity.view()),
        );
        Ok(identity)
    }

    // =========================================================================
    // PEER AUTHENTICATION
    // =========================================================================

    /// Check a peer's claimed instance id and key.
    ///
    /// A known peer may present its own key or ours. An unknown instance
    /// must present ours and yields `None`.
    pub fn authenticate_peer(
        &self,
        instance_id: Uuid,
        api_key: &str,
    ) -> FederationResult<Option<FederatedNode>> {
        let identity = self.identity()?;
        let own_key = constant_time_str_eq(api_key, &identity.api_key);

        match self.peer_by_instance(instance_id)? {
            Some(peer) => {
                let peer_key = peer
                    .api_key_hash
                    .as_deref()
                    .map_or(false, |hash| constant_time_str_eq(&hash_secret(api_key), hash));
                if peer_key || own_key {
                    Ok(Some(peer))
                } else {
                    Err(FederationError::Unauthorized)
                }
            }
            None if own_key => Ok(None),
            None => Err(FederationError::Unauthorized),
        }
    }

    fn peer_by_instance(&self, instance_id: Uuid) -> FederationResult<Option<FederatedNode>> {
        Ok(self
            .peers
            .find(&|p: &FederatedNode| p.instance_id == Some(instance_id))?
            .into_iter()
            .next())
    }

    fn peer(&self, node_id: Uuid) -> FederationResult<FederatedNode> {
        self.peers
            .get(&node_id.to_string())?
            .ok_or(FederationError::NodeNotFound(node_id))
    }

    // =========================================================================
    // NEGOTIATION
    // =========================================================================

    /// Record an outgoing partnership request and a placeholder for the
    /// target, seen as our future principle.
    pub async fn send_partnership_request(
        &self,
        actor: &str,
        target_domain: &str,
        message: Option<String>,
    ) -> FederationResult<FederationRequest> {
        if !valid_domain(target_domain) {
            return Err(FederationError::Validation(format!(
                "invalid domain: {}",
                target_domain
            )));
        }
        let _guard = self.guard.lock().await;
        let identity = self.identity()?;
        if target_domain == identity.domain {
            return Err(FederationError::Validation(
                "cannot federate with this instance's own domain".into(),
            ));
        }
        let existing = self.peers.find(&|p: &FederatedNode| {
            p.domain == target_domain && p.status != PeerStatus::Disconnected
        })?;
        if !existing.is_empty() {
            return Err(FederationError::Conflict(format!(
                "{} is already a federated node",
                target_domain
            )));
        }

        let placeholder = FederatedNode::new(target_domain, PeerRole::Principle, PeerStatus::Pending);
        self.peers.put(&placeholder)?;

        let now = Utc::now();
        let request = FederationRequest {
            id: Uuid::new_v4(),
            from_instance_id: identity.instance_id,
            from_name: identity.name.clone(),
            from_domain: identity.domain.clone(),
            to_instance_id: None,
            to_domain: Some(target_domain.to_string()),
            request_type: RequestType::Partnership,
            status: RequestStatus::Pending,
            message,
            expires_at: None,
            node_id: Some(placeholder.id),
            epoch: identity.epoch,
            from_api_key_hash: None,
            resolution: None,
            created_at: now,
            resolved_at: None,
        };
        self.requests.put(&request)?;

        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federation_request", request.id, "PARTNERSHIP_REQUEST")
                .after(&request),
        );
        Ok(request)
    }

    /// Record a request delivered by a peer.
    ///
    /// PROMOTION requests are only accepted from a known partner and expire
    /// after the promotion timeout.
    pub async fn receive_request(&self, incoming: IncomingRequest) -> FederationResult<FederationRequest> {
        let _guard = self.guard.lock().await;
        let identity = self.identity()?;
        if incoming.from_instance_id == identity.instance_id {
            return Err(FederationError::Validation("request from this instance".into()));
        }
        peer_epoch(incoming.epoch, identity.epoch)?;
        let now = Utc::now();
        let peer = self.peer_by_instance(incoming.from_instance_id)?;

        let (node_id, expires_at) = match incoming.request_type {
            RequestType::Partnership => (peer.map(|p| p.id), None),
            RequestType::Promotion => {
                let peer = peer
                    .filter(|p| p.role == PeerRole::Partner)
                    .ok_or_else(|| {
                        FederationError::InvalidRole("promotion requests must come from a partner".into())
                    })?;
                (Some(peer.id), Some(now + self.promotion_timeout()))
            }
        };

        let request = FederationRequest {
            id: Uuid::new_v4(),
            from_instance_id: incoming.from_instance_id,
            from_name: incoming.from_name,
            from_domain: incoming.from_domain,
            to_instance_id: Some(identity.instance_id),
            to_domain: Some(identity.domain.clone()),
            request_type: incoming.request_type,
            status: RequestStatus::Pending,
            message: incoming.message,
            expires_at,
            node_id,
            epoch: incoming.epoch,
            from_api_key_hash: incoming.api_key.as_deref().map(hash_secret),
            resolution: None,
            created_at: now,
            resolved_at: None,
        };
        self.requests.put(&request)?;
        tracing::info!(
            request_id = %request.id,
            from = %request.from_instance_id,
            request_type = ?request.request_type,
            "federation request received"
        );
        Ok(request)
    }

    /// Accept or reject a pending incoming request.
    pub async fn respond_to_request(
        &self,
        actor: &str,
        request_id: Uuid,
        accept: bool,
    ) -> FederationResult<FederationRequest> {
        let _guard = self.guard.lock().await;
        let now = Utc::now();
        let mut identity = self.identity()?;
        let mut request = self
            .requests
            .get(&request_id.to_string())?
            .filter(|r| {
                r.status == RequestStatus::Pending
                    && r.from_instance_id != identity.instance_id
                    && !r.is_expired(now)
            })
            .ok_or(FederationError::NotFoundOrProcessed(request_id))?;
        let before_identity = identity.view();

        if !accept {
            request.resolve(RequestStatus::Rejected, "rejected", now);
            self.requests.put(&request)?;
            audit::record(
                &*self.audit,
                AuditRecord::new(actor, "federation_request", request.id, "REQUEST_REJECT")
                    .after(&request),
            );
            return Ok(request);
        }

        match request.request_type {
            RequestType::Partnership => {
                if identity.role == IdentityRole::Partner {
                    return Err(FederationError::InvalidRole(
                        "a partner cannot accept partnership requests".into(),
                    ));
                }
                if identity.role != IdentityRole::Principle {
                    identity.role = IdentityRole::Principle;
                    identity.principle_id = None;
                    identity.epoch = next_epoch(identity.epoch)?;
                    self.save_identity(&mut identity)?;
                }

                let mut peer = match self.peer_by_instance(request.from_instance_id)? {
                    Some(peer) => peer,
                    None => FederatedNode::new(
                        request.from_domain.clone(),
                        PeerRole::Partner,
                        PeerStatus::Connected,
                    ),
                };
                peer.instance_id = Some(request.from_instance_id);
                peer.name = Some(request.from_name.clone());
                peer.role = PeerRole::Partner;
                peer.status = PeerStatus::Connected;
                peer.last_heartbeat = Some(now);
                peer.epoch = peer.epoch.max(request.epoch);
                if request.from_api_key_hash.is_some() {
                    peer.api_key_hash = request.from_api_key_hash.clone();
                }
                self.peers.put(&peer)?;
                request.node_id = Some(peer.id);
            }

            RequestType::Promotion => {
                if request.epoch < identity.epoch {
                    request.resolve(RequestStatus::Rejected, "superseded", now);
                    self.requests.put(&request)?;
                    tracing::warn!(request_id = %request.id, "promotion request superseded");
                    return Err(FederationError::Superseded(request.id));
                }
                let mut peer = self
                    .peer_by_instance(request.from_instance_id)?
                    .ok_or(FederationError::NotFoundOrProcessed(request_id))?;

                identity.role = IdentityRole::Partner;
                identity.principle_id = Some(request.from_instance_id);
                identity.epoch = next_epoch(identity.epoch)?;
                self.save_identity(&mut identity)?;

                peer.role = PeerRole::Principle;
                peer.clear_promotion_request();
                peer.epoch = identity.epoch;
                self.peers.put(&peer)?;
            }
        }

        request.resolve(RequestStatus::Acknowledged, "accepted", now);
        self.requests.put(&request)?;

        if before_identity.role != identity.role {
            LifecycleEvent::FederationRoleChanged.emit(identity.instance_id, &identity.role.to_string());
        }
        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federation_identity", identity.instance_id, "REQUEST_ACCEPT")
                .before(&before_identity)
                .after(&identity.view()),
        );
        Ok(request)
    }

    /// Apply a peer's answer to our pending partnership request.
    ///
    /// Acceptance makes this instance a PARTNER of the answering principle.
    /// Rejection drops the placeholder node.
    pub async fn receive_partnership_answer(
        &self,
        answer: PartnershipAnswer,
    ) -> FederationResult<FederationRequest> {
        let _guard = self.guard.lock().await;
        let now = Utc::now();
        let mut identity = self.identity()?;
        let mut request = self
            .requests
            .find(&|r: &FederationRequest| {
                r.request_type == RequestType::Partnership
                    && r.status == RequestStatus::Pending
                    && r.from_instance_id == identity.instance_id
                    && r.to_domain.as_deref() == Some(answer.domain.as_str())
            })?
            .into_iter()
            .next()
            .ok_or_else(|| {
                FederationError::Validation(format!(
                    "no pending partnership request to {}",
                    answer.domain
                ))
            })?;
        let placeholder = match request.node_id {
            Some(node_id) => self.peers.get(&node_id.to_string())?,
            None => None,
        };

        if !answer.accepted {
            if let Some(node) = placeholder {
                self.peers.delete(&node.id.to_string())?;
            }
            request.resolve(RequestStatus::Rejected, "rejected", now);
            self.requests.put(&request)?;
            tracing::info!(request_id = %request.id, domain = %answer.domain, "partnership rejected by peer");
            return Ok(request);
        }

        if identity.role == IdentityRole::Principle {
            return Err(FederationError::InvalidRole(
                "a principle cannot join another federation".into(),
            ));
        }
        let epoch = next_epoch(identity.epoch)?.max(peer_epoch(answer.epoch, identity.epoch)?);
        let before = identity.view();
        identity.role = IdentityRole::Partner;
        identity.principle_id = Some(answer.instance_id);
        identity.epoch = epoch;
        self.save_identity(&mut identity)?;

        let mut node = placeholder.unwrap_or_else(|| {
            FederatedNode::new(answer.domain.clone(), PeerRole::Principle, PeerStatus::Connected)
        });
        node.instance_id = Some(answer.instance_id);
        node.name = Some(answer.name.clone());
        node.role = PeerRole::Principle;
        node.status = PeerStatus::Connected;
        node.epoch = node.epoch.max(answer.epoch);
        node.last_heartbeat = Some(now);
        if let Some(key) = answer.api_key.as_deref() {
            node.api_key_hash = Some(hash_secret(key));
        }
        self.peers.put(&node)?;

        request.to_instance_id = Some(answer.instance_id);
        request.node_id = Some(node.id);
        request.resolve(RequestStatus::Acknowledged, "accepted", now);
        self.requests.put(&request)?;

        LifecycleEvent::FederationRoleChanged.emit(identity.instance_id, "PARTNER");
        audit::record(
            &*self.audit,
            AuditRecord::new(answer.instance_id.to_string(), "federation_identity", identity.instance_id, "PARTNERSHIP_ACCEPTED")
                .before(&before)
                .after(&identity.view()),
        );
        Ok(request)
    }

    /// Ask our principle to hand over the principle role.
    pub async fn request_promotion(
        &self,
        actor: &str,
        node_id: Uuid,
    ) -> FederationResult<FederationRequest> {
        let _guard = self.guard.lock().await;
        let identity = self.identity()?;
        if identity.role != IdentityRole::Partner {
            return Err(FederationError::InvalidRole(
                "only a partner can request promotion".into(),
            ));
        }
        let mut peer = self.peer(node_id)?;
        if peer.role != PeerRole::Principle {
            return Err(FederationError::InvalidRole(
                "promotion can only target the principle".into(),
            ));
        }
        let open = self.requests.find(&|r: &FederationRequest| {
            r.request_type == RequestType::Promotion
                && r.status == RequestStatus::Pending
                && r.from_instance_id == identity.instance_id
                && r.node_id == Some(node_id)
        })?;
        if !open.is_empty() {
            return Err(FederationError::Conflict(
                "a promotion request is already pending".into(),
            ));
        }

        let now = Utc::now();
        let request = FederationRequest {
            id: Uuid::new_v4(),
            from_instance_id: identity.instance_id,
            from_name: identity.name.clone(),
            from_domain: identity.domain.clone(),
            to_instance_id: peer.instance_id,
            to_domain: Some(peer.domain.clone()),
            request_type: RequestType::Promotion,
            status: RequestStatus::Pending,
            message: None,
            expires_at: Some(now + self.promotion_timeout()),
            node_id: Some(peer.id),
            epoch: identity.epoch,
            from_api_key_hash: None,
            resolution: None,
            created_at: now,
            resolved_at: None,
        };
        self.requests.put(&request)?;

        peer.promotion_request_at = Some(now);
        peer.promotion_request_by = Some(identity.instance_id);
        self.peers.put(&peer)?;

        LifecycleEvent::PromotionRequested.emit(request.id, &peer.domain);
        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federation_request", request.id, "PROMOTION_REQUEST")
                .after(&request),
        );
        Ok(request)
    }

    fn promotion_timeout(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.config.promotion_timeout_ms as i64)
    }

    /// Resolve PROMOTION requests whose deadline passed before `now`.
    ///
    /// Our own unanswered requests promote us to PRINCIPLE and demote the
    /// target's local record to PARTNER, unless our epoch moved on since the
    /// request was made. Expired incoming requests are rejected. Each
    /// request is resolved once; repeated polling is a no-op.
    pub async fn resolve_expired_promotions(
        &self,
        now: DateTime<Utc>,
    ) -> FederationResult<Vec<FederationRequest>> {
        let _guard = self.guard.lock().await;
        self.resolve_expired_locked(now)
    }

    fn resolve_expired_locked(&self, now: DateTime<Utc>) -> FederationResult<Vec<FederationRequest>> {
        let mut identity = self.identity()?;
        let mut expired = self.requests.find(&|r: &FederationRequest| {
            r.request_type == RequestType::Promotion
                && r.status == RequestStatus::Pending
                && r.is_expired(now)
        })?;
        expired.sort_by_key(|r| r.created_at);

        let mut resolved = Vec::with_capacity(expired.len());
        for mut request in expired {
            if request.from_instance_id != identity.instance_id {
                request.resolve(RequestStatus::Rejected, "expired", now);
                self.requests.put(&request)?;
                resolved.push(request);
                continue;
            }
            if request.epoch < identity.epoch {
                request.resolve(RequestStatus::Rejected, "superseded", now);
                self.requests.put(&request)?;
                tracing::warn!(request_id = %request.id, "expired promotion superseded");
                resolved.push(request);
                continue;
            }

            let before = identity.view();
            identity.role = IdentityRole::Principle;
            identity.principle_id = None;
            identity.epoch = next_epoch(identity.epoch)?;
            self.save_identity(&mut identity)?;

            if let Some(node_id) = request.node_id {
                if let Some(mut peer) = self.peers.get(&node_id.to_string())? {
                    peer.role = PeerRole::Partner;
                    peer.clear_promotion_request();
                    self.peers.put(&peer)?;
                }
            }
            request.resolve(RequestStatus::Acknowledged, "timeout", now);
            self.requests.put(&request)?;

            LifecycleEvent::PromotionTimedOut.emit(request.id, "self-promoted to PRINCIPLE");
            audit::record(
                &*self.audit,
                AuditRecord::new("system", "federation_identity", identity.instance_id, "PROMOTION_TIMEOUT")
                    .before(&before)
                    .after(&identity.view()),
            );
            resolved.push(request);
        }
        Ok(resolved)
    }

    /// Identity, peers and pending requests, after resolving timeouts.
    pub async fn status(&self) -> FederationResult<FederationStatus> {
        let _guard = self.guard.lock().await;
        self.resolve_expired_locked(Utc::now())?;

        let identity = self.identity()?;
        let mut pending_requests = self
            .requests
            .find(&|r: &FederationRequest| r.status == RequestStatus::Pending)?;
        pending_requests.sort_by_key(|r| r.created_at);
        Ok(FederationStatus {
            identity: identity.view(),
            nodes: self.peers.list()?,
            pending_requests,
        })
    }

    /// Hand the principle role to one of our partners.
    pub async fn promote_partner(&self, actor: &str, node_id: Uuid) -> FederationResult<FederatedNode> {
        let _guard = self.guard.lock().await;
        let mut identity = self.identity()?;
        if identity.role != IdentityRole::Principle {
            return Err(FederationError::InvalidRole(
                "only the principle can promote a partner".into(),
            ));
        }
        let mut peer = self.peer(node_id)?;
        if peer.role != PeerRole::Partner {
            return Err(FederationError::InvalidRole("target is not a partner".into()));
        }
        let instance_id = peer.instance_id.ok_or_else(|| {
            FederationError::Validation("partner has not completed negotiation".into())
        })?;
        let before = identity.view();

        identity.role = IdentityRole::Partner;
        identity.principle_id = Some(instance_id);
        identity.epoch = next_epoch(identity.epoch)?;
        self.save_identity(&mut identity)?;

        peer.role = PeerRole::Principle;
        peer.clear_promotion_request();
        peer.epoch = identity.epoch;
        self.peers.put(&peer)?;

        LifecycleEvent::FederationRoleChanged.emit(identity.instance_id, "PARTNER");
        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federation_identity", identity.instance_id, "PROMOTE_PARTNER")
                .before(&before)
                .after(&identity.view()),
        );
        Ok(peer)
    }

    /// Our principle resigned in our favor.
    pub async fn accept_resignation(&self, peer: &FederatedNode, epoch: u64) -> FederationResult<ControlPlaneIdentity> {
        let _guard = self.guard.lock().await;
        let mut identity = self.identity()?;
        if identity.role != IdentityRole::Partner || identity.principle_id != peer.instance_id {
            return Err(FederationError::InvalidRole(
                "resignation must come from our principle".into(),
            ));
        }
        if epoch < identity.epoch {
            return Err(FederationError::Conflict(format!(
                "stale resignation at epoch {} (current {})",
                epoch, identity.epoch
            )));
        }
        peer_epoch(epoch, identity.epoch)?;
        let before = identity.view();

        identity.role = IdentityRole::Principle;
        identity.principle_id = None;
        identity.epoch = next_epoch(epoch.max(identity.epoch))?;
        self.save_identity(&mut identity)?;

        let mut record = self.peer(peer.id)?;
        record.role = PeerRole::Partner;
        record.clear_promotion_request();
        record.epoch = record.epoch.max(epoch);
        self.peers.put(&record)?;

        LifecycleEvent::FederationRoleChanged.emit(identity.instance_id, "PRINCIPLE");
        audit::record(
            &*self.audit,
            AuditRecord::new(peer.id.to_string(), "federation_identity", identity.instance_id, "ACCEPT_RESIGNATION")
                .before(&before)
                .after(&identity.view()),
        );
        Ok(identity)
    }

    /// Forget a peer and its sync history.
    pub async fn disconnect_node(&self, actor: &str, node_id: Uuid) -> FederationResult<()> {
        let _guard = self.guard.lock().await;
        let peer = self.peer(node_id)?;
        let mut identity = self.identity()?;

        for log in self.sync_logs.find(&|l: &SyncLog| l.node_id == node_id)? {
            self.sync_logs.delete(&log.id.to_string())?;
        }
        self.peers.delete(&node_id.to_string())?;

        if peer.instance_id.is_some() && identity.principle_id == peer.instance_id {
            identity.role = IdentityRole::Standalone;
            identity.principle_id = None;
            identity.epoch = next_epoch(identity.epoch)?;
            self.save_identity(&mut identity)?;
        }

        LifecycleEvent::PeerDisconnected.emit(node_id, &peer.domain);
        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federated_node", node_id, "DISCONNECT")
                .before(&peer)
                .after(&identity.view()),
        );
        Ok(())
    }

    // =========================================================================
    // HEARTBEAT AND SYNC
    // =========================================================================

    /// Record a heartbeat from an authenticated peer.
    ///
    /// Every peer's epoch is tracked on its record, but only our principle's
    /// epoch is adopted: a partner's counter never supersedes our own
    /// pending requests.
    pub async fn heartbeat(&self, peer: &FederatedNode, epoch: u64) -> FederationResult<HeartbeatAck> {
        let _guard = self.guard.lock().await;
        let mut identity = self.identity()?;
        let epoch = peer_epoch(epoch, identity.epoch)?;

        let mut record = self.peer(peer.id)?;
        record.last_heartbeat = Some(Utc::now());
        if record.status != PeerStatus::Syncing {
            record.status = PeerStatus::Connected;
        }
        record.epoch = record.epoch.max(epoch);
        self.peers.put(&record)?;

        let from_principle =
            record.instance_id.is_some() && identity.principle_id == record.instance_id;
        if from_principle && epoch > identity.epoch {
            identity.epoch = epoch;
            self.save_identity(&mut identity)?;
        }
        Ok(HeartbeatAck {
            instance_id: identity.instance_id,
            role: identity.role,
            epoch: identity.epoch,
        })
    }

    pub fn list_nodes(&self) -> FederationResult<Vec<FederatedNode>> {
        Ok(self.peers.list()?)
    }

    pub async fn toggle_sync(&self, actor: &str, node_id: Uuid, enabled: bool) -> FederationResult<FederatedNode> {
        let mut peer = self.peer(node_id)?;
        let before = peer.clone();
        peer.sync_enabled = enabled;
        self.peers.put(&peer)?;
        audit::record(
            &*self.audit,
            AuditRecord::new(actor, "federated_node", node_id, "TOGGLE_SYNC")
                .before(&before)
                .after(&peer),
        );
        Ok(peer)
    }

    /// Push our cluster metadata to a peer or pull theirs.
    ///
    /// Transport failures are recorded on the returned log, not raised.
    pub async fn trigger_sync(
        &self,
        actor: &str,
        node_id: Uuid,
        direction: SyncDirection,
    ) -> FederationResult<SyncLog> {
        let mut peer = self.peer(node_id)?;
        if !peer.sync_enabled {
            return Err(FederationError::Validation("sync is disabled for this node".into()));
        }
        if peer.status != PeerStatus::Connected {
            return Err(FederationError::Validation(format!(
                "node is not connected ({:?})",
                peer.status
            )));
        }

        peer.status = PeerStatus::Syncing;
        self.peers.put(&peer)?;
        let mut log = SyncLog {
            id: Uuid::new_v4(),
            node_id,
            direction,
            status: SyncStatus::InProgress,
            records: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.sync_logs.put(&log)?;

        let outcome = match direction {
            SyncDirection::Push => match self.snapshot() {
                Ok(snapshot) => self.transport.push(&peer, &snapshot).await,
                Err(err) => Err(err),
            },
            SyncDirection::Pull => match self.transport.pull(&peer).await {
                Ok(snapshot) => self.apply(&snapshot),
                Err(err) => Err(err),
            },
        };
        match outcome {
            Ok(records) => {
                log.status = SyncStatus::Completed;
                log.records = records;
            }
            Err(err) => {
                tracing::warn!(node_id = %node_id, error = %err, "sync failed");
                log.status = SyncStatus::Failed;
                log.error = Some(err.to_string());
            }
        }
        log.completed_at = Some(Utc::now());
        self.sync_logs.put(&log)?;

        let mut peer = self.peer(node_id)?;
        peer.status = PeerStatus::Connected;
        self.peers.put(&peer)?;

        LifecycleEvent::SyncFinished.emit(node_id, &format!("{:?} {:?}", log.direction, log.status));
        let record = AuditRecord::new(actor, "sync_log", log.id, "TRIGGER_SYNC").after(&log);
        audit::record(
            &*self.audit,
            match &log.error {
                Some(error) => record.failed(error),
                None => record,
            },
        );
        Ok(log)
    }

    /// Sync history for a peer, newest first.
    pub fn sync_logs(&self, node_id: Uuid) -> FederationResult<Vec<SyncLog>> {
        let mut logs = self.sync_logs.find(&|l: &SyncLog| l.node_id == node_id)?;
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(logs)
    }

    fn snapshot(&self) -> FederationResult<SyncSnapshot> {
        Ok(SyncSnapshot {
            clusters: self.registry.list_clusters()?,
            nodes: self.registry.all_nodes()?,
        })
    }

    fn apply(&self, snapshot: &SyncSnapshot) -> FederationResult<u64> {
        for cluster in &snapshot.clusters {
            self.registry.upsert_cluster(cluster)?;
        }
        for node in &snapshot.nodes {
            self.registry.upsert_node(node)?;
        }
        Ok(snapshot.record_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::federation::transport::{MemoryTransport, NullTransport};
    use crate::registry::{Node, NodeRole};
    use crate::store::MemoryRepository;

    fn service_with(transport: Arc<dyn SyncTransport>, registry: Arc<NodeRegistry>) -> FederationService {
        FederationService::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            registry,
            transport,
            Arc::new(MemoryAuditLog::new()),
            FederationConfig::default(),
        )
    }

    fn service() -> FederationService {
        service_with(Arc::new(NullTransport), Arc::new(NodeRegistry::in_memory()))
    }

    fn incoming(kind: RequestType, from: Uuid, key: &str) -> IncomingRequest {
        IncomingRequest {
            from_instance_id: from,
            from_name: "east".into(),
            from_domain: "east.example.com".into(),
            request_type: kind,
            message: None,
            api_key: Some(key.into()),
            epoch: 0,
        }
    }

    /// A principle with one connected partner.
    async fn principle_with_partner(svc: &FederationService) -> (Uuid, FederatedNode) {
        let partner = Uuid::new_v4();
        let req = svc
            .receive_request(incoming(RequestType::Partnership, partner, "partner-key"))
            .await
            .unwrap();
        svc.respond_to_request("admin", req.id, true).await.unwrap();
        let node = svc.peer_by_instance(partner).unwrap().unwrap();
        (partner, node)
    }

    /// This instance as a partner of a principle at east.example.com.
    async fn partner_of_principle(svc: &FederationService) -> (Uuid, FederatedNode) {
        let principle = Uuid::new_v4();
        svc.send_partnership_request("admin", "east.example.com", None)
            .await
            .unwrap();
        svc.receive_partnership_answer(PartnershipAnswer {
            instance_id: principle,
            name: "east".into(),
            domain: "east.example.com".into(),
            accepted: true,
            epoch: 1,
            api_key: Some("principle-key".into()),
        })
        .await
        .unwrap();
        let node = svc.peer_by_instance(principle).unwrap().unwrap();
        (principle, node)
    }

    #[test]
    fn test_domain_validation() {
        assert!(valid_domain("cp.example.com"));
        assert!(valid_domain("localhost:8080"));
        assert!(!valid_domain("not a domain"));
        assert!(!valid_domain("-bad.example.com"));
    }

    #[tokio::test]
    async fn test_identity_created_once_as_standalone() {
        let svc = service();
        let first = svc.identity().unwrap();
        assert_eq!(first.role, IdentityRole::Standalone);
        assert_eq!(svc.identity().unwrap().instance_id, first.instance_id);

        let updated = svc
            .update_identity("admin", Some("west".into()), Some("west.example.com".into()))
            .await
            .unwrap();
        assert_eq!(updated.domain, "west.example.com");
        assert!(svc
            .update_identity("admin", None, Some("bad domain".into()))
            .await
            .is_err());

        let rotated = svc.regenerate_api_key("admin").await.unwrap();
        assert_ne!(rotated.api_key, first.api_key);
    }

    #[tokio::test]
    async fn test_send_partnership_creates_placeholder() {
        let svc = service();
        let req = svc
            .send_partnership_request("admin", "east.example.com", Some("hello".into()))
            .await
            .unwrap();
        assert_eq!(req.status, RequestStatus::Pending);

        let node = svc.peer(req.node_id.unwrap()).unwrap();
        assert_eq!((node.role, node.status), (PeerRole::Principle, PeerStatus::Pending));
        assert!(matches!(
            svc.send_partnership_request("admin", "east.example.com", None).await,
            Err(FederationError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_partnership_makes_principle() {
        let svc = service();
        let (partner, node) = principle_with_partner(&svc).await;

        let identity = svc.identity().unwrap();
        assert_eq!(identity.role, IdentityRole::Principle);
        assert_eq!(identity.epoch, 1);
        assert_eq!((node.role, node.status), (PeerRole::Partner, PeerStatus::Connected));
        assert!(node.last_heartbeat.is_some());

        // The partner can now authenticate with its own key.
        let authed = svc.authenticate_peer(partner, "partner-key").unwrap();
        assert_eq!(authed.unwrap().id, node.id);
        assert!(matches!(
            svc.authenticate_peer(partner, "wrong"),
            Err(FederationError::Unauthorized)
        ));
        assert!(svc
            .authenticate_peer(Uuid::new_v4(), &identity.api_key)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_respond_twice_is_not_found() {
        let svc = service();
        let req = svc
            .receive_request(incoming(RequestType::Partnership, Uuid::new_v4(), "k"))
            .await
            .unwrap();
        let rejected = svc.respond_to_request("admin", req.id, false).await.unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);

        let err = svc.respond_to_request("admin", req.id, true).await.unwrap_err();
        assert!(matches!(err, FederationError::NotFoundOrProcessed(_)));
        assert!(err.to_string().contains("not found or already processed"));
    }

    #[tokio::test]
    async fn test_accept_promotion_demotes_self() {
        let svc = service();
        let (partner, node) = principle_with_partner(&svc).await;

        let mut req = incoming(RequestType::Promotion, partner, "partner-key");
        req.epoch = 1;
        let req = svc.receive_request(req).await.unwrap();
        assert!(req.expires_at.is_some());
        svc.respond_to_request("admin", req.id, true).await.unwrap();

        let identity = svc.identity().unwrap();
        assert_eq!(identity.role, IdentityRole::Partner);
        assert_eq!(identity.principle_id, Some(partner));
        assert_eq!(svc.peer(node.id).unwrap().role, PeerRole::Principle);
    }

    #[tokio::test]
    async fn test_stale_promotion_is_superseded() {
        let svc = service();
        let (partner, _) = principle_with_partner(&svc).await;

        // Issued at epoch 0, before this instance became principle.
        let req = svc
            .receive_request(incoming(RequestType::Promotion, partner, "partner-key"))
            .await
            .unwrap();
        let err = svc.respond_to_request("admin", req.id, true).await.unwrap_err();
        assert!(matches!(err, FederationError::Superseded(_)));
        assert_eq!(svc.identity().unwrap().role, IdentityRole::Principle);
        assert_eq!(
            svc.requests.get(&req.id.to_string()).unwrap().unwrap().status,
            RequestStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_promotion_from_stranger_rejected() {
        let svc = service();
        let err = svc
            .receive_request(incoming(RequestType::Promotion, Uuid::new_v4(), "k"))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::InvalidRole(_)));
    }

    #[tokio::test]
    async fn test_promote_partner_and_disconnect() {
        let svc = service();
        let (partner, node) = principle_with_partner(&svc).await;

        let promoted = svc.promote_partner("admin", node.id).await.unwrap();
        assert_eq!(promoted.role, PeerRole::Principle);
        let identity = svc.identity().unwrap();
        assert_eq!(identity.role, IdentityRole::Partner);
        assert_eq!(identity.principle_id, Some(partner));

        svc.disconnect_node("admin", node.id).await.unwrap();
        let identity = svc.identity().unwrap();
        assert_eq!(identity.role, IdentityRole::Standalone);
        assert!(identity.principle_id.is_none());
        assert!(svc.list_nodes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_promotion_requires_partner() {
        let svc = service();
        let (_, node) = principle_with_partner(&svc).await;
        assert!(matches!(
            svc.request_promotion("admin", node.id).await,
            Err(FederationError::InvalidRole(_))
        ));
    }

    #[tokio::test]
    async fn test_resignation_restores_principle() {
        let svc = service();
        let (_, node) = principle_with_partner(&svc).await;
        svc.promote_partner("admin", node.id).await.unwrap();
        let epoch = svc.identity().unwrap().epoch;

        let peer = svc.peer(node.id).unwrap();
        assert!(svc.accept_resignation(&peer, epoch - 1).await.is_err());
        let identity = svc.accept_resignation(&peer, epoch).await.unwrap();
        assert_eq!(identity.role, IdentityRole::Principle);
        assert_eq!(identity.epoch, epoch + 1);
        assert_eq!(svc.peer(node.id).unwrap().role, PeerRole::Partner);
    }

    #[tokio::test]
    async fn test_heartbeat_moves_epoch_forward_only() {
        let svc = service();
        let (_, node) = partner_of_principle(&svc).await;

        let ack = svc.heartbeat(&node, 5).await.unwrap();
        assert_eq!(ack.epoch, 5);
        let ack = svc.heartbeat(&node, 2).await.unwrap();
        assert_eq!(ack.epoch, 5);
        assert_eq!(svc.peer(node.id).unwrap().epoch, 5);
    }

    #[tokio::test]
    async fn test_partner_heartbeat_does_not_move_our_epoch() {
        let svc = service();
        let (_, node) = principle_with_partner(&svc).await;
        let epoch = svc.identity().unwrap().epoch;

        let ack = svc.heartbeat(&node, epoch + 6).await.unwrap();
        assert_eq!(ack.epoch, epoch);
        assert_eq!(svc.peer(node.id).unwrap().epoch, epoch + 6);
        assert_eq!(svc.identity().unwrap().epoch, epoch);
    }

    #[tokio::test]
    async fn test_runaway_epoch_is_refused() {
        let svc = service();
        let (_, node) = partner_of_principle(&svc).await;
        let before = svc.identity().unwrap();

        let err = svc.heartbeat(&node, u64::MAX).await.unwrap_err();
        assert!(matches!(err, FederationError::EpochOutOfRange { .. }));
        assert_eq!(err.status_code(), 409);
        assert_eq!(svc.identity().unwrap().epoch, before.epoch);
        assert!(svc.peer(node.id).unwrap().epoch < u64::MAX);
        assert!(matches!(
            svc.accept_resignation(&node, u64::MAX).await,
            Err(FederationError::EpochOutOfRange { .. })
        ));
        assert_eq!(svc.identity().unwrap().role, IdentityRole::Partner);
    }

    #[test]
    fn test_epoch_arithmetic_never_wraps() {
        assert_eq!(next_epoch(4).unwrap(), 5);
        assert!(matches!(
            next_epoch(u64::MAX),
            Err(FederationError::EpochOutOfRange { .. })
        ));
        assert_eq!(peer_epoch(10 + MAX_EPOCH_STEP, 10).unwrap(), 10 + MAX_EPOCH_STEP);
        assert!(peer_epoch(11 + MAX_EPOCH_STEP, 10).is_err());
        assert!(peer_epoch(u64::MAX, u64::MAX - 1).is_ok());
    }

    #[tokio::test]
    async fn test_sync_push_and_pull() {
        let registry = Arc::new(NodeRegistry::in_memory());
        let cluster = registry.create_cluster("orders").unwrap();
        registry
            .register_node(Node::new(cluster.id, "a", "10.0.0.1", 5432, NodeRole::Primary))
            .unwrap();
        let transport = Arc::new(MemoryTransport::default());
        let svc = service_with(transport.clone(), registry.clone());
        let (_, node) = principle_with_partner(&svc).await;

        assert!(matches!(
            svc.trigger_sync("admin", node.id, SyncDirection::Push).await,
            Err(FederationError::Validation(_))
        ));
        svc.toggle_sync("admin", node.id, true).await.unwrap();

        let log = svc.trigger_sync("admin", node.id, SyncDirection::Push).await.unwrap();
        assert_eq!(log.status, SyncStatus::Completed);
        assert_eq!(log.records, 2);
        assert_eq!(transport.remote().nodes.len(), 1);

        let log = svc.trigger_sync("admin", node.id, SyncDirection::Pull).await.unwrap();
        assert_eq!(log.status, SyncStatus::Completed);
        assert_eq!(svc.peer(node.id).unwrap().status, PeerStatus::Connected);
        assert_eq!(svc.sync_logs(node.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_failure_is_logged() {
        let svc = service();
        let (_, node) = principle_with_partner(&svc).await;
        svc.toggle_sync("admin", node.id, true).await.unwrap();

        let log = svc.trigger_sync("admin", node.id, SyncDirection::Pull).await.unwrap();
        assert_eq!(log.status, SyncStatus::Failed);
        assert!(log.error.is_some());
        assert_eq!(svc.peer(node.id).unwrap().status, PeerStatus::Connected);
    }

    #[tokio::test]
    async fn test_partnership_answer_makes_partner() {
        let svc = service();
        let (principle, node) = partner_of_principle(&svc).await;

        let identity = svc.identity().unwrap();
        assert_eq!(identity.role, IdentityRole::Partner);
        assert_eq!(identity.principle_id, Some(principle));
        assert_eq!((node.role, node.status), (PeerRole::Principle, PeerStatus::Connected));
        assert!(svc.authenticate_peer(principle, "principle-key").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejected_answer_drops_placeholder() {
        let svc = service();
        svc.send_partnership_request("admin", "east.example.com", None)
            .await
            .unwrap();
        let request = svc
            .receive_partnership_answer(PartnershipAnswer {
                instance_id: Uuid::new_v4(),
                name: "east".into(),
                domain: "east.example.com".into(),
                accepted: false,
                epoch: 0,
                api_key: None,
            })
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Rejected);
        assert!(svc.list_nodes().unwrap().is_empty());
        assert_eq!(svc.identity().unwrap().role, IdentityRole::Standalone);
    }

    #[tokio::test]
    async fn test_promotion_timeout_self_promotes_once() {
        let svc = service();
        let (_, node) = partner_of_principle(&svc).await;
        let request = svc.request_promotion("admin", node.id).await.unwrap();
        assert!(matches!(
            svc.request_promotion("admin", node.id).await,
            Err(FederationError::Conflict(_))
        ));

        let deadline = request.expires_at.unwrap();
        let early = svc
            .resolve_expired_promotions(deadline - ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert!(early.is_empty());
        assert_eq!(svc.identity().unwrap().role, IdentityRole::Partner);

        let late = deadline + ChronoDuration::milliseconds(1);
        let resolved = svc.resolve_expired_promotions(late).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, RequestStatus::Acknowledged);
        assert_eq!(svc.identity().unwrap().role, IdentityRole::Principle);
        assert_eq!(svc.peer(node.id).unwrap().role, PeerRole::Partner);

        let epoch = svc.identity().unwrap().epoch;
        assert!(svc.resolve_expired_promotions(late).await.unwrap().is_empty());
        assert_eq!(svc.identity().unwrap().epoch, epoch);
    }

    #[tokio::test]
    async fn test_expired_promotion_superseded_by_newer_epoch() {
        let svc = service();
        let (_, node) = partner_of_principle(&svc).await;
        let request = svc.request_promotion("admin", node.id).await.unwrap();

        // A heartbeat carrying a newer assignment arrives before the deadline.
        svc.heartbeat(&node, request.epoch + 5).await.unwrap();

        let late = request.expires_at.unwrap() + ChronoDuration::seconds(1);
        let resolved = svc.resolve_expired_promotions(late).await.unwrap();
        assert_eq!(resolved[0].status, RequestStatus::Rejected);
        assert_eq!(resolved[0].resolution.as_deref(), Some("superseded"));
        assert_eq!(svc.identity().unwrap().role, IdentityRole::Partner);
    }
}
