//! # HTTP Server
//!
//! Combines the subsystem routers into one axum application.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::config::HttpServerConfig;
use super::credential_routes::credential_routes;
use super::failover_routes::failover_routes;
use super::federation_routes::federation_routes;
use super::registry_routes::registry_routes;
use crate::app::ControlPlane;
use crate::observability::LifecycleEvent;

/// HTTP API for one control plane.
pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        let config = plane.config().http.clone();
        let router = Self::build_router(&config, plane);
        Self { config, router }
    }

    fn build_router(config: &HttpServerConfig, plane: Arc<ControlPlane>) -> Router {
        let cors = if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        Router::new()
            .route("/health", get(health))
            .merge(registry_routes(plane.clone()))
            .nest("/failovers", failover_routes(plane.clone()))
            .nest("/credentials", credential_routes(plane.clone()))
            .nest("/federation", federation_routes(plane))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    pub fn router(self) -> Router {
        self.router
    }

    /// Bind and serve until the process exits.
    pub async fn start(self) -> std::io::Result<()> {
        let addr: SocketAddr = self.config.socket_addr().parse().map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid listen address {}: {}", self.config.socket_addr(), err),
            )
        })?;
        let listener = TcpListener::bind(addr).await?;
        LifecycleEvent::Serving.emit(addr, "control plane API listening");
        axum::serve(listener, self.router).await
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
