//! The classified error taxonomy the gateway's request pipeline matches on.
//!
//! [`GatewayError`] is a `thiserror`-derived taxonomy used on the request
//! path, where call sites branch on `kind` rather than inspecting error
//! strings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Request-path error taxonomy (§7). Distinct from [`crate::providers::ErrorKind`]
/// (which classifies a single upstream attempt) — this is the error the
/// gateway ultimately returns to the client after the fallback loop ends.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no provider available for model `{0}`")]
    NoProviderAvailable(String),

    #[error("all upstream attempts failed: {message} (last status {status})")]
    AllAttemptsFailed { status: u16, message: String },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("client disconnected")]
    ClientDisconnected,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// HTTP status this error should be reported as, per §4.6 step 15.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoProviderAvailable(_) => StatusCode::BAD_REQUEST,
            Self::AllAttemptsFailed { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::DeadlineExceeded => StatusCode::BAD_GATEWAY,
            Self::ClientDisconnected => StatusCode::OK, // never actually written to the wire
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body shape specified for non-streaming failures:
    /// `{error:{message, type:"provider_error"}}`.
    pub fn body_json(&self) -> serde_json::Value {
        json!({ "error": { "message": self.to_string(), "type": "provider_error" } })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.body_json())).into_response()
    }
}
