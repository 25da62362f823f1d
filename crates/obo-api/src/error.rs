//! Error types for the relay API.
//!
//! [`ApiError`] implements [`axum::response::IntoResponse`] so handlers can
//! return `Result<…, ApiError>` directly.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use obo_relay::RelayError;
use serde_json::json;

/// Errors that end a request without a relay response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The relay refused or abandoned the request.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The request body is not a valid relay request.
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Relay(RelayError::MissingBearer | RelayError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            Self::Relay(RelayError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Relay(
                RelayError::UnknownOperation(_) | RelayError::UnknownTarget { .. } | RelayError::InvalidTarget(_),
            ) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        } else {
            tracing::warn!(%status, error = %message, "request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}
