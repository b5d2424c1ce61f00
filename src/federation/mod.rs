//! Federation
//!
//! Peer-to-peer relationships between control-plane instances: identity,
//! partnership and promotion negotiation with timeout-based self-promotion,
//! heartbeats and cluster metadata sync.

mod errors;
mod model;
mod service;
mod transport;

pub use errors::{FederationError, FederationResult};
pub use model::{
    ControlPlaneIdentity, FederatedNode, FederationRequest, FederationStatus, HeartbeatAck,
    IdentityRole, IdentityView, IncomingRequest, PartnershipAnswer, PeerRole, PeerStatus,
    RequestStatus, RequestType, SyncDirection, SyncLog, SyncStatus, IDENTITY_KEY,
};
pub use service::FederationService;
pub use transport::{MemoryTransport, NullTransport, SyncSnapshot, SyncTransport};
