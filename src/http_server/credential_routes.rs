//! Superuser credential routes. Every mutation requires an MFA-verified
//! operator.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::errors::ApiResult;
use super::extract::Operator;
use crate::app::ControlPlane;
use crate::credential::{
    CredentialAlert, CredentialPropagation, CredentialStatusView, CredentialView,
    PropagationReport, RotationCheck,
};

#[derive(Debug, Default, Deserialize)]
pub struct CheckParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertParams {
    #[serde(default)]
    pub include_resolved: bool,
}

pub fn credential_routes(state: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/", get(credential_status))
        .route("/initialize", post(initialize))
        .route("/rotate", post(rotate))
        .route("/check-rotation", post(check_rotation))
        .route("/propagate", post(propagate_all))
        .route("/propagate/:node_id", post(propagate))
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id/resolve", post(resolve_alert))
        .with_state(state)
}

async fn credential_status(
    State(plane): State<Arc<ControlPlane>>,
) -> ApiResult<Json<CredentialStatusView>> {
    Ok(Json(plane.credentials().status()?))
}

async fn initialize(
    State(plane): State<Arc<ControlPlane>>,
    Operator(actor): Operator,
) -> ApiResult<(StatusCode, Json<CredentialView>)> {
    let view = plane.credentials().initialize(&actor).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn rotate(
    State(plane): State<Arc<ControlPlane>>,
    Operator(actor): Operator,
) -> ApiResult<Json<CredentialView>> {
    Ok(Json(plane.credentials().rotate(&actor).await?))
}

async fn check_rotation(
    State(plane): State<Arc<ControlPlane>>,
    Operator(actor): Operator,
    Query(params): Query<CheckParams>,
) -> ApiResult<Json<RotationCheck>> {
    Ok(Json(
        plane.credentials().check_rotation(&actor, params.force).await?,
    ))
}

async fn propagate(
    State(plane): State<Arc<ControlPlane>>,
    Operator(actor): Operator,
    Path(node_id): Path<Uuid>,
) -> ApiResult<Json<CredentialPropagation>> {
    Ok(Json(plane.credentials().propagate(&actor, node_id).await?))
}

async fn propagate_all(
    State(plane): State<Arc<ControlPlane>>,
    Operator(actor): Operator,
) -> ApiResult<Json<PropagationReport>> {
    Ok(Json(plane.credentials().propagate_all(&actor).await?))
}

async fn list_alerts(
    State(plane): State<Arc<ControlPlane>>,
    Query(params): Query<AlertParams>,
) -> ApiResult<Json<Vec<CredentialAlert>>> {
    Ok(Json(plane.credentials().alerts(params.include_resolved)?))
}

async fn resolve_alert(
    State(plane): State<Arc<ControlPlane>>,
    Operator(actor): Operator,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CredentialAlert>> {
    Ok(Json(plane.credentials().resolve_alert(&actor, id)?))
}
