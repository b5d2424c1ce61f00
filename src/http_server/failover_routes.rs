//! Failover routes.

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
use crate::failover::{CreateFailover, FailoverOperation};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub cluster_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackParams {
    #[serde(default)]
    pub compensate: bool,
}

pub fn failover_routes(state: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/", get(list_failovers).post(create_failover))
        .route("/:id", get(get_failover))
        .route("/:id/execute", post(execute_failover))
        .route("/:id/rollback", post(rollback_failover))
        .route("/:id/cancel", post(cancel_failover))
        .with_state(state)
}

async fn create_failover(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Json(body): Json<CreateFailover>,
) -> ApiResult<(StatusCode, Json<FailoverOperation>)> {
    let op = plane.failover().create(body, operator.user_id()).await?;
    Ok((StatusCode::CREATED, Json(op)))
}

async fn list_failovers(
    State(plane): State<Arc<ControlPlane>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<FailoverOperation>>> {
    Ok(Json(plane.failover().list(params.cluster_id)?))
}

async fn get_failover(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FailoverOperation>> {
    Ok(Json(plane.failover().get(id)?))
}

/// Accepted for execution; progress is visible through `GET /:id`.
async fn execute_failover(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Query(params): Query<ExecuteParams>,
) -> ApiResult<(StatusCode, Json<FailoverOperation>)> {
    let op = plane
        .failover()
        .execute(id, operator.user_id(), params.force)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(op)))
}

async fn rollback_failover(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Query(params): Query<RollbackParams>,
) -> ApiResult<Json<FailoverOperation>> {
    let op = plane
        .failover()
        .rollback(id, operator.user_id(), params.compensate)
        .await?;
    Ok(Json(op))
}

async fn cancel_failover(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FailoverOperation>> {
    Ok(Json(plane.failover().cancel(id, operator.user_id()).await?))
}
