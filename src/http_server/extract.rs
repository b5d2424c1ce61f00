//! Request identity extraction.
//!
//! Operators identify themselves with `x-user-id`; an upstream gateway sets
//! `x-mfa-verified: true` once the user has passed MFA. Peers authenticate
//! with `x-instance-id` and `x-api-key`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use uuid::Uuid;

use super::errors::ApiError;
use crate::credential::Actor;

pub const USER_HEADER: &str = "x-user-id";
pub const MFA_HEADER: &str = "x-mfa-verified";
pub const INSTANCE_HEADER: &str = "x-instance-id";
pub const API_KEY_HEADER: &str = "x-api-key";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The operator making a request.
#[derive(Debug, Clone)]
pub struct Operator(pub Actor);

impl Operator {
    pub fn user_id(&self) -> &str {
        &self.0.user_id
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(&parts.headers, USER_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing x-user-id header"))?;
        let mfa_verified = header(&parts.headers, MFA_HEADER)
            .map_or(false, |v| v.eq_ignore_ascii_case("true"));
        Ok(Operator(Actor::new(user_id, mfa_verified)))
    }
}

/// Claimed peer identity, verified by the handler against the federation
/// service.
#[derive(Debug, Clone)]
pub struct PeerCredentials {
    pub instance_id: Uuid,
    pub api_key: String,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for PeerCredentials {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let instance_id = header(&parts.headers, INSTANCE_HEADER)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| ApiError::unauthorized("missing or invalid x-instance-id header"))?;
        let api_key = header(&parts.headers, API_KEY_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing x-api-key header"))?
            .to_string();
        Ok(PeerCredentials {
            instance_id,
            api_key,
        })
    }
}
