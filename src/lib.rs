//! pgfleet - control plane for PostgreSQL fleets
//!
//! Coordinates replica promotion, rotates and propagates the shared
//! superuser credential, and federates with peer control planes.

pub mod app;
pub mod audit;
pub mod cli;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod failover;
pub mod federation;
pub mod http_server;
pub mod observability;
pub mod pg;
pub mod registry;
pub mod store;
