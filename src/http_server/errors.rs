//! API error responses.
//!
//! Every subsystem error folds into one JSON body:
//! `{"error": {"code": "...", "message": "..."}}` with the subsystem's status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::credential::CredentialError;
use crate::failover::FailoverError;
use crate::federation::FederationError;
use crate::pg::PgError;
use crate::registry::RegistryError;
use crate::store::StoreError;

/// Error returned by every handler.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "BAD_REQUEST", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

macro_rules! api_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ApiError {
                fn from(err: $ty) -> Self {
                    ApiError::new(err.status_code(), err.code(), err.to_string())
                }
            }
        )*
    };
}

api_error_from!(
    StoreError,
    RegistryError,
    PgError,
    FailoverError,
    CredentialError,
    FederationError,
);

pub type ApiResult<T> = Result<T, ApiError>;
