//! # HTTP API
//!
//! axum routes for every control-plane operation.
//!
//! # Endpoints
//!
//! - `/health` - Health check
//! - `/clusters`, `/nodes` - Node registry
//! - `/failovers/*` - Failover operations
//! - `/credentials/*` - Superuser credential rotation and propagation
//! - `/federation/*` - Identity, peers and negotiation
//! - `/federation/peer/*` - Calls from other control planes

mod config;
mod credential_routes;
mod errors;
mod extract;
mod failover_routes;
mod federation_routes;
mod registry_routes;
mod server;

pub use config::HttpServerConfig;
pub use errors::{ApiError, ApiResult};
pub use extract::{Operator, PeerCredentials};
pub use server::HttpServer;
