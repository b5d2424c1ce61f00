//! Credential Rotation & Propagation
//!
//! One superuser secret shared by every managed node:
//! - Rotation keeps a bounded, newest-first history of superseded passwords
//! - Propagation tries the current password, then the history, and repairs
//!   nodes still on an older password
//! - Nodes that accept nothing known get one open re-enrollment alert
//! - Every mutation requires an MFA-verified actor

mod engine;
mod errors;
mod model;

pub use engine::CredentialEngine;
pub use errors::{CredentialError, CredentialResult};
pub use model::{
    Actor, CredentialAlert, CredentialPropagation, CredentialStatus, CredentialStatusView,
    CredentialView, PropagationReport, PropagationStatus, RotationCheck, SuperuserCredential,
    ALERT_NEEDS_REENROLLMENT,
};
