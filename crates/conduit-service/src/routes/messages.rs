//! `POST [/{channel}]/v1/messages` — Anthropic-dialect endpoint.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use serde_json::Value;

use crate::error::ApiError;
use crate::pipeline::{self, AppState, IncomingRequest};
use crate::routes::{buffered_json, check_gateway_key, headers_to_map, sse_response};

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/v1/messages", post(handle))
        .route("/orchids/v1/messages", post(handle))
        .route("/warp/v1/messages", post(handle))
        .route("/grok/v1/messages", post(handle))
}

async fn handle(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body_bytes: Bytes,
) -> Result<Response, ApiError> {
    check_gateway_key(&state, &headers)?;

    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok()).map(str::to_string);
    let body: Value = serde_json::from_slice(&body_bytes)
        .map_err(|e| ApiError(conduit_core::error::GatewayError::invalid_request(format!("malformed JSON body: {e}"))))?;
    let body_bytes = body_bytes.to_vec();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let incoming = IncomingRequest {
        path: uri.path().to_string(),
        headers: headers_to_map(&headers),
        authorization,
        body_bytes,
        body,
    };

    let outcome = pipeline::run(&state, incoming).await?;
    let pipeline::PipelineOutcome::Stream { receiver, message_id, model, .. } = outcome;

    if stream {
        Ok(sse_response(receiver, |event| conduit_translate::anthropic_sse::render(event)))
    } else {
        let collector = buffered_json(receiver).await;
        Ok(Json(collector.into_anthropic_json(message_id, model)).into_response())
    }
}
