//! Wraps `GatewayError` for axum response conversion; a local newtype is
//! required since both the trait and the error type are foreign to this
//! crate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use conduit_core::error::GatewayError;

pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_envelope())).into_response()
    }
}
