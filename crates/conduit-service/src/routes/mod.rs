//! Inbound HTTP surface: the three routes of the wire contract, each a thin
//! handler that builds an `IncomingRequest`, runs the pipeline, and renders
//! the result in its own dialect.

pub mod chat_completions;
pub mod count_tokens;
pub mod messages;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use conduit_translate::translator::TranslatedEvent;
use conduit_translate::json_envelope::NonStreamingCollector;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::ApiError;
use crate::pipeline::AppState;

pub fn headers_to_map(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string())))
        .collect()
}

pub fn check_gateway_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(key) = &state.config.gateway_key else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(key.as_str()) {
        return Err(ApiError(conduit_core::error::GatewayError::new(
            conduit_core::error::SurfaceCode::Authentication,
            "invalid or missing gateway key",
        )));
    }
    Ok(())
}

/// Drains the translator's event channel into a single streaming HTTP
/// response, rendering each event through `render` as it arrives. Events the
/// renderer has nothing to say about (`render` returns `None`) are skipped
/// rather than terminating the stream.
pub fn sse_response<F>(receiver: UnboundedReceiver<TranslatedEvent>, render: F) -> Response
where
    F: FnMut(&TranslatedEvent) -> Option<String> + Send + 'static,
{
    let stream = futures::stream::unfold((receiver, render), |(mut receiver, mut render)| async move {
        loop {
            match receiver.recv().await {
                Some(event) => {
                    if let Some(frame) = render(&event) {
                        return Some((Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(frame)), (receiver, render)));
                    }
                }
                None => return None,
            }
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response parts are always valid")
}

/// Drains the translator's event channel into the buffered non-streaming
/// JSON envelope shared by both dialects.
pub async fn buffered_json(mut receiver: UnboundedReceiver<TranslatedEvent>) -> NonStreamingCollector {
    let mut collector = NonStreamingCollector::default();
    while let Some(event) = receiver.recv().await {
        collector.feed(&event);
    }
    collector
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .merge(messages::router())
        .merge(chat_completions::router())
        .merge(count_tokens::router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
