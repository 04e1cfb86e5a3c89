//! `POST /v1/chat/completions` — OpenAI-dialect endpoint.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use conduit_translate::openai_sse::OpenAiRenderer;
use serde_json::Value;

use crate::error::ApiError;
use crate::pipeline::{self, AppState, IncomingRequest};
use crate::routes::{buffered_json, check_gateway_key, headers_to_map, sse_response};

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new().route("/v1/chat/completions", post(handle))
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

    let created = chrono::Utc::now().timestamp();
    if stream {
        let mut renderer = OpenAiRenderer::new(message_id, model, created);
        Ok(sse_response(receiver, move |event| renderer.render(event)))
    } else {
        let collector = buffered_json(receiver).await;
        Ok(Json(collector.into_openai_json(message_id, model, created)).into_response())
    }
}
