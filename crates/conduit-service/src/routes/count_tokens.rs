//! `POST /v1/messages/count_tokens` — a synchronous token-count estimate.
//! Counting itself (picking an exact tokenizer) is out of scope; this is a
//! heuristic char-based estimate, never dispatched upstream.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use conduit_core::request::{CanonicalRequest, ContentBlock, MessageContent};
use serde_json::json;

use crate::error::ApiError;
use crate::pipeline::AppState;
use crate::routes::check_gateway_key;

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new().route("/v1/messages/count_tokens", post(handle))
}

/// Chars-per-token used by the heuristic; not a real tokenizer, just a
/// stable approximation good enough to warn callers before a real dispatch.
const CHARS_PER_TOKEN: f64 = 4.0;

fn estimate(chars: usize) -> u32 {
    ((chars as f64) / CHARS_PER_TOKEN).ceil() as u32
}

fn block_text_len(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text, .. } => text.len(),
        ContentBlock::ToolUse { input, .. } => input.to_string().len(),
        ContentBlock::ToolResult { content, .. } => content.to_string().len(),
        ContentBlock::Image { .. } | ContentBlock::Document { .. } => 0,
    }
}

async fn handle(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<CanonicalRequest>,
) -> Result<Response, ApiError> {
    check_gateway_key(&state, &headers)?;

    let system_chars: usize = request.system.iter().map(|s| s.text.len()).sum();
    let history_chars: usize = request
        .messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(text) => text.len(),
            MessageContent::Blocks(blocks) => blocks.iter().map(block_text_len).sum(),
        })
        .sum();
    let tools_chars: usize = request
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|t| t.input_schema.to_string().len() + t.name.len())
        .sum();

    let base_prompt_tokens = estimate(request.model.len());
    let system_context_tokens = estimate(system_chars);
    let history_tokens = estimate(history_chars);
    let tools_tokens = estimate(tools_chars);
    let input_tokens = base_prompt_tokens + system_context_tokens + history_tokens + tools_tokens;

    Ok(Json(json!({
        "input_tokens": input_tokens,
        "prompt_profile": if request.tools.is_some() { "tool_enabled" } else { "plain" },
        "breakdown": {
            "base_prompt_tokens": base_prompt_tokens,
            "system_context_tokens": system_context_tokens,
            "history_tokens": history_tokens,
            "tools_tokens": tools_tokens,
        }
    }))
    .into_response())
}
