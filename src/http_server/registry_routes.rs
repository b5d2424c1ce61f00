//! Cluster and node registry routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::errors::ApiResult;
use super::extract::Operator;
use crate::app::ControlPlane;
use crate::audit::{self, AuditRecord};
use crate::failover::NodeWalReport;
use crate::registry::{Cluster, Node, NodeLifecycleEvent, NodeRole};

#[derive(Debug, Deserialize)]
pub struct CreateCluster {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNode {
    pub cluster_id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub replication_slot: Option<String>,
}

pub fn registry_routes(state: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/clusters", get(list_clusters).post(create_cluster))
        .route("/clusters/:id", get(get_cluster))
        .route("/clusters/:id/nodes", get(list_nodes))
        .route("/nodes", post(register_node))
        .route("/nodes/:id", get(get_node).delete(remove_node))
        .route("/nodes/:id/events", get(node_events))
        .route("/nodes/:id/wal", get(node_wal))
        .with_state(state)
}

async fn create_cluster(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Json(body): Json<CreateCluster>,
) -> ApiResult<(StatusCode, Json<Cluster>)> {
    let cluster = plane.registry().create_cluster(body.name)?;
    audit::record(
        &**plane.audit(),
        AuditRecord::new(operator.user_id(), "cluster", cluster.id, "CLUSTER_CREATE").after(&cluster),
    );
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn list_clusters(State(plane): State<Arc<ControlPlane>>) -> ApiResult<Json<Vec<Cluster>>> {
    Ok(Json(plane.registry().list_clusters()?))
}

async fn get_cluster(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Cluster>> {
    Ok(Json(plane.registry().get_cluster(id)?))
}

async fn list_nodes(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Node>>> {
    plane.registry().get_cluster(id)?;
    Ok(Json(plane.registry().list_nodes(id)?))
}

async fn register_node(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Json(body): Json<RegisterNode>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let mut node = Node::new(body.cluster_id, body.name, body.host, body.port, body.role);
    if let Some(database) = body.database {
        node.database = database;
    }
    node.connection_string = body.connection_string;
    if let Some(slot) = body.replication_slot {
        node = node.with_replication_slot(slot);
    }
    let node = plane.registry().register_node(node)?;
    audit::record(
        &**plane.audit(),
        AuditRecord::new(operator.user_id(), "node", node.id, "NODE_REGISTER").after(&node),
    );
    Ok((StatusCode::CREATED, Json(node)))
}

async fn get_node(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Node>> {
    Ok(Json(plane.registry().get_node(id)?))
}

async fn remove_node(
    State(plane): State<Arc<ControlPlane>>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let node = plane.registry().get_node(id)?;
    plane.registry().remove_node(id, &**plane.failover())?;
    audit::record(
        &**plane.audit(),
        AuditRecord::new(operator.user_id(), "node", id, "NODE_REMOVE").before(&node),
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn node_events(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<NodeLifecycleEvent>>> {
    plane.registry().get_node(id)?;
    Ok(Json(plane.registry().events_for(id)?))
}

/// Live WAL position and replication slots, read with the superuser login.
async fn node_wal(
    State(plane): State<Arc<ControlPlane>>,
    _operator: Operator,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<NodeWalReport>> {
    Ok(Json(plane.failover().inspect_node(id).await?))
}
