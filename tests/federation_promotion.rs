//! Federation Promotion Tests
//!
//! Two control planes negotiating through their public service surface:
//! - Partnership handshake and peer authentication
//! - Unanswered promotion requests self-promote exactly once
//! - A handed-over principle role supersedes older requests

use std::sync::Arc;

use chrono::{Duration, Utc};
use pgfleet::audit::MemoryAuditLog;
use pgfleet::config::FederationConfig;
use pgfleet::federation::{
    FederatedNode, FederationError, FederationService, IdentityRole, IncomingRequest,
    NullTransport, PartnershipAnswer, PeerRole, RequestStatus, RequestType,
};
use pgfleet::registry::NodeRegistry;
use pgfleet::store::MemoryRepository;
use uuid::Uuid;

fn instance(domain: &str) -> FederationService {
    FederationService::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(MemoryRepository::new()),
        Arc::new(MemoryRepository::new()),
        Arc::new(MemoryRepository::new()),
        Arc::new(NodeRegistry::in_memory()),
        Arc::new(NullTransport),
        Arc::new(MemoryAuditLog::new()),
        FederationConfig {
            domain: domain.to_string(),
            ..FederationConfig::default()
        },
    )
}

fn peer_for(svc: &FederationService, instance_id: Uuid) -> FederatedNode {
    svc.list_nodes()
        .unwrap()
        .into_iter()
        .find(|p| p.instance_id == Some(instance_id))
        .unwrap()
}

/// `partner` joins the federation led by `principle`.
async fn join(principle: &FederationService, partner: &FederationService) {
    let p = principle.identity().unwrap();
    partner
        .send_partnership_request("admin", &p.domain, None)
        .await
        .unwrap();
    let w = partner.identity().unwrap();
    let request = principle
        .receive_request(IncomingRequest {
            from_instance_id: w.instance_id,
            from_name: w.name.clone(),
            from_domain: w.domain.clone(),
            request_type: RequestType::Partnership,
            message: None,
            api_key: Some(w.api_key.clone()),
            epoch: w.epoch,
        })
        .await
        .unwrap();
    principle
        .respond_to_request("admin", request.id, true)
        .await
        .unwrap();

    let p = principle.identity().unwrap();
    partner
        .receive_partnership_answer(PartnershipAnswer {
            instance_id: p.instance_id,
            name: p.name.clone(),
            domain: p.domain.clone(),
            accepted: true,
            epoch: p.epoch,
            api_key: Some(p.api_key.clone()),
        })
        .await
        .unwrap();
}

/// East becomes principle with west as its partner.
async fn federate() -> (FederationService, FederationService) {
    let east = instance("east.example.com");
    let west = instance("west.example.com");
    join(&east, &west).await;
    (east, west)
}

/// West asks east for the principle role; east records the request.
async fn request_promotion(
    east: &FederationService,
    west: &FederationService,
) -> pgfleet::federation::FederationRequest {
    let e = east.identity().unwrap();
    let principle = peer_for(west, e.instance_id);
    let outgoing = west.request_promotion("admin", principle.id).await.unwrap();

    let w = west.identity().unwrap();
    east.receive_request(IncomingRequest {
        from_instance_id: w.instance_id,
        from_name: w.name.clone(),
        from_domain: w.domain.clone(),
        request_type: RequestType::Promotion,
        message: None,
        api_key: None,
        epoch: outgoing.epoch,
    })
    .await
    .unwrap();
    outgoing
}

// =============================================================================
// Handshake
// =============================================================================

/// Both sides agree on roles and recognise each other's keys.
#[tokio::test]
async fn test_partnership_handshake() {
    let (east, west) = federate().await;
    let e = east.identity().unwrap();
    let w = west.identity().unwrap();

    assert_eq!(e.role, IdentityRole::Principle);
    assert_eq!(w.role, IdentityRole::Partner);
    assert_eq!(w.principle_id, Some(e.instance_id));
    assert_eq!(peer_for(&east, w.instance_id).role, PeerRole::Partner);
    assert_eq!(peer_for(&west, e.instance_id).role, PeerRole::Principle);

    let seen = east.authenticate_peer(w.instance_id, &w.api_key).unwrap();
    assert_eq!(seen.map(|p| p.instance_id), Some(Some(w.instance_id)));
    assert!(matches!(
        east.authenticate_peer(w.instance_id, "guess"),
        Err(FederationError::Unauthorized)
    ));
    assert!(west.authenticate_peer(e.instance_id, &e.api_key).unwrap().is_some());
}

// =============================================================================
// Promotion timeout
// =============================================================================

/// No answer within the timeout: the partner promotes itself once.
#[tokio::test]
async fn test_unanswered_promotion_self_promotes_once() {
    let (east, west) = federate().await;
    let outgoing = request_promotion(&east, &west).await;
    let deadline = outgoing.expires_at.unwrap();
    assert_eq!(deadline - outgoing.created_at, Duration::seconds(30));

    assert!(west
        .resolve_expired_promotions(deadline - Duration::milliseconds(1))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(west.identity().unwrap().role, IdentityRole::Partner);

    let resolved = west
        .resolve_expired_promotions(deadline + Duration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].status, RequestStatus::Acknowledged);
    let w = west.identity().unwrap();
    assert_eq!(w.role, IdentityRole::Principle);
    assert_eq!(w.principle_id, None);
    let e = east.identity().unwrap();
    assert_eq!(peer_for(&west, e.instance_id).role, PeerRole::Partner);

    // Later polls do nothing.
    for extra in [1, 30, 300] {
        let later = deadline + Duration::seconds(extra);
        assert!(west.resolve_expired_promotions(later).await.unwrap().is_empty());
    }
    assert_eq!(west.identity().unwrap().epoch, w.epoch);

    // East drops the stale incoming request instead of acting on it.
    let expired = east
        .resolve_expired_promotions(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, RequestStatus::Rejected);
    assert_eq!(expired[0].resolution.as_deref(), Some("expired"));

    // East tracks west's new epoch without adopting it from a partner.
    let ack = east
        .heartbeat(&peer_for(&east, w.instance_id), w.epoch)
        .await
        .unwrap();
    assert_eq!(ack.epoch, e.epoch);
    assert_eq!(peer_for(&east, w.instance_id).epoch, w.epoch);
}

/// Epochs gossiped by another partner do not cancel an unanswered request.
#[tokio::test]
async fn test_other_partner_heartbeat_keeps_timeout_intact() {
    let (east, west) = federate().await;
    let north = instance("north.example.com");
    join(&east, &north).await;
    let n = north.identity().unwrap();

    let outgoing = request_promotion(&east, &west).await;

    // North reports a much newer epoch to east; east's role is unchanged.
    let ack = east
        .heartbeat(&peer_for(&east, n.instance_id), n.epoch + 6)
        .await
        .unwrap();
    let e = east.identity().unwrap();
    assert_eq!(e.role, IdentityRole::Principle);
    assert_eq!(ack.epoch, e.epoch);

    // East's own heartbeat then reaches west.
    west.heartbeat(&peer_for(&west, e.instance_id), ack.epoch)
        .await
        .unwrap();

    let late = outgoing.expires_at.unwrap() + Duration::milliseconds(1);
    let resolved = west.resolve_expired_promotions(late).await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].status, RequestStatus::Acknowledged);
    assert_eq!(west.identity().unwrap().role, IdentityRole::Principle);
}

/// A peer claiming an absurd epoch is refused before anything changes.
#[tokio::test]
async fn test_runaway_peer_epoch_refused() {
    let (east, west) = federate().await;
    let w = west.identity().unwrap();
    let e = east.identity().unwrap();

    let err = east
        .heartbeat(&peer_for(&east, w.instance_id), u64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::EpochOutOfRange { .. }));

    // The principle can still hand over its role afterwards.
    let partner = east
        .promote_partner("admin", peer_for(&east, w.instance_id).id)
        .await
        .unwrap();
    assert_eq!(partner.role, PeerRole::Principle);
    assert_eq!(east.identity().unwrap().epoch, e.epoch + 1);
}

/// Promotion accepted and resignation delivered: the old request is superseded.
#[tokio::test]
async fn test_handover_supersedes_pending_request() {
    let (east, west) = federate().await;
    let outgoing = request_promotion(&east, &west).await;
    let w = west.identity().unwrap();

    let incoming = east
        .status()
        .await
        .unwrap()
        .pending_requests
        .into_iter()
        .find(|r| r.request_type == RequestType::Promotion)
        .unwrap();
    east.respond_to_request("admin", incoming.id, true).await.unwrap();
    let e = east.identity().unwrap();
    assert_eq!(e.role, IdentityRole::Partner);
    assert_eq!(e.principle_id, Some(w.instance_id));

    let w = west
        .accept_resignation(&peer_for(&west, e.instance_id), e.epoch)
        .await
        .unwrap();
    assert_eq!(w.role, IdentityRole::Principle);
    assert!(w.epoch > e.epoch);

    let late = outgoing.expires_at.unwrap() + Duration::seconds(1);
    let resolved = west.resolve_expired_promotions(late).await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].status, RequestStatus::Rejected);
    assert_eq!(resolved[0].resolution.as_deref(), Some("superseded"));
    assert_eq!(west.identity().unwrap().epoch, w.epoch);
}

/// A stale resignation is refused.
#[tokio::test]
async fn test_stale_resignation_rejected() {
    let (east, west) = federate().await;
    let e = east.identity().unwrap();
    let w = west.identity().unwrap();
    assert!(w.epoch >= 1);

    let err = west
        .accept_resignation(&peer_for(&west, e.instance_id), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::Conflict(_)));
    assert_eq!(west.identity().unwrap().role, IdentityRole::Partner);
}
