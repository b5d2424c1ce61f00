//! Federation routes.
//!
//! Operator routes manage this instance's identity and peers. Peer routes
//! under `/peer` are called by other control planes and authenticate with
//! `x-instance-id` and `x-api-key`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::errors::{ApiError, ApiResult};
use super::extract::{Operator, PeerCredentials};
use crate::app::ControlPlane;
use crate::federation::{
    FederatedNode, FederationRequest, FederationStatus, HeartbeatAck, IdentityView,
    IncomingRequest, PartnershipAnswer, SyncDirection, SyncLog,
};

#[derive(Debug, Deserialize)]
pub struct UpdateIdentity {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartnershipBody {
    pub domain: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RespondBody {
    pub accept: bool,
}

#[derive(Debug, Deserialize)]
pub struct ToggleSyncBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TriggerSyncBody {
    pub direction: SyncDirection,
}

#[derive(Debug, Deserialize)]
pub struct EpochBody {
    pub epoch: u64,
}

/// Identity with the raw key, returned only to the operator who asked for
/// a new one.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegeneratedKey {
    pub identity: IdentityView,
    pub api_key: String,
}

pub fn federation_routes(state: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/", get(federation_status))
        .route("/identity", get(get_identity).patch(update_identity))
        .route("/identity/api-key", post(regenerate_api_key))
        .route("/requests", post(send_partnership_request))
        .route("/requests/:id/respond", post(respond_to_request))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:id", delete(disconnect_node))
        .route("/nodes/:id/promotion", post(request_promotion))
        .route("/nodes/:id/promote", post(promote_partner))
        .route("/nodes/:id/sync", put(toggle_sync).post(trigger_sync))
        .route("/nodes/:id/sync-logs", get(sync_logs))
        .route("/peer/requests", post(peer_request))
        .route("/peer/answers", post(peer_answer))
        .route("/peer/heartbeat", post(peer_heartbeat))
        .route("/peer/resign", post(peer_resign))
        .with_state(state)
}

// ==================
// Operator routes
// ==================

async fn federation_status(
    State(plane): State<Arc<ControlPlane>>,
) -> ApiResult<Json<FederationStatus>> {
    Ok(Json(plane.federation().status().await?))
}

async fn get_identity(State(plane): State<Arc<ControlPlane>>) -> ApiResult<Json<IdentityView>> {
    Ok(Json(plane.federation().identity()?.view()))
}

async fn update_identity(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Json(body): Json<UpdateIdentity>,
) -> ApiResult<Json<IdentityView>> {
    let identity = plane
        .federation()
        .update_identity(operator.user_id(), body.name, body.domain)
        .await?;
    Ok(Json(identity.view()))
}

async fn regenerate_api_key(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
) -> ApiResult<Json<RegeneratedKey>> {
    let identity = plane
        .federation()
        .regenerate_api_key(operator.user_id())
        .await?;
    Ok(Json(RegeneratedKey {
        identity: identity.view(),
        api_key: identity.api_key,
    }))
}

async fn send_partnership_request(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Json(body): Json<PartnershipBody>,
) -> ApiResult<(StatusCode, Json<FederationRequest>)> {
    let request = plane
        .federation()
        .send_partnership_request(operator.user_id(), &body.domain, body.message)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn respond_to_request(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Json(body): Json<RespondBody>,
) -> ApiResult<Json<FederationRequest>> {
    Ok(Json(
        plane
            .federation()
            .respond_to_request(operator.user_id(), id, body.accept)
            .await?,
    ))
}

async fn list_nodes(State(plane): State<Arc<ControlPlane>>) -> ApiResult<Json<Vec<FederatedNode>>> {
    Ok(Json(plane.federation().list_nodes()?))
}

async fn disconnect_node(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    plane
        .federation()
        .disconnect_node(operator.user_id(), id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn request_promotion(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<FederationRequest>)> {
    let request = plane
        .federation()
        .request_promotion(operator.user_id(), id)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn promote_partner(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FederatedNode>> {
    Ok(Json(
        plane
            .federation()
            .promote_partner(operator.user_id(), id)
            .await?,
    ))
}

async fn toggle_sync(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Json(body): Json<ToggleSyncBody>,
) -> ApiResult<Json<FederatedNode>> {
    Ok(Json(
        plane
            .federation()
            .toggle_sync(operator.user_id(), id, body.enabled)
            .await?,
    ))
}

async fn trigger_sync(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Json(body): Json<TriggerSyncBody>,
) -> ApiResult<Json<SyncLog>> {
    Ok(Json(
        plane
            .federation()
            .trigger_sync(operator.user_id(), id, body.direction)
            .await?,
    ))
}

async fn sync_logs(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<SyncLog>>> {
    Ok(Json(plane.federation().sync_logs(id)?))
}

// ==================
// Peer routes
// ==================

async fn peer_request(
    State(plane): State<Arc<ControlPlane>>,
    peer: PeerCredentials,
    Json(body): Json<IncomingRequest>,
) -> ApiResult<(StatusCode, Json<FederationRequest>)> {
    if body.from_instance_id != peer.instance_id {
        return Err(ApiError::bad_request("fromInstanceId does not match x-instance-id"));
    }
    plane
        .federation()
        .authenticate_peer(peer.instance_id, &peer.api_key)?;
    let request = plane.federation().receive_request(body).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn peer_answer(
    State(plane): State<Arc<ControlPlane>>,
    peer: PeerCredentials,
    Json(body): Json<PartnershipAnswer>,
) -> ApiResult<Json<FederationRequest>> {
    if body.instance_id != peer.instance_id {
        return Err(ApiError::bad_request("instanceId does not match x-instance-id"));
    }
    plane
        .federation()
        .authenticate_peer(peer.instance_id, &peer.api_key)?;
    Ok(Json(plane.federation().receive_partnership_answer(body).await?))
}

fn known_peer(plane: &ControlPlane, peer: &PeerCredentials) -> ApiResult<FederatedNode> {
    plane
        .federation()
        .authenticate_peer(peer.instance_id, &peer.api_key)?
        .ok_or_else(|| ApiError::unauthorized("unknown federation peer"))
}

async fn peer_heartbeat(
    State(plane): State<Arc<ControlPlane>>,
    peer: PeerCredentials,
    Json(body): Json<EpochBody>,
) -> ApiResult<Json<HeartbeatAck>> {
    let node = known_peer(&plane, &peer)?;
    Ok(Json(plane.federation().heartbeat(&node, body.epoch).await?))
}

async fn peer_resign(
    State(plane): State<Arc<ControlPlane>>,
    peer: PeerCredentials,
    Json(body): Json<EpochBody>,
) -> ApiResult<Json<IdentityView>> {
    let node = known_peer(&plane, &peer)?;
    let identity = plane
        .federation()
        .accept_resignation(&node, body.epoch)
        .await?;
    Ok(Json(identity.view()))
}
