//! HTTP/SSE upstream client: POSTs the translated request and parses the
//! provider's `text/event-stream` body frame-by-frame, grounded on the same
//! `content_block_start`/`content_block_delta`/`message_delta` shapes an
//! Anthropic-compatible streaming response uses.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::error::GatewayError;
use conduit_core::event::{FinishReason, NormalizedEvent};
use conduit_core::request::{CanonicalRequest, ContentBlock, MessageContent, Role};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::client::{OnEvent, UpstreamClient};
use crate::credentials::CredentialManager;

/// Upstream providers require an explicit cap; the canonical request doesn't
/// carry one, so every request asks for the same generous ceiling.
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct SseClient {
    http: reqwest::Client,
    base_url: url::Url,
    credentials: Arc<dyn CredentialManager>,
    account_id: u64,
}

impl SseClient {
    pub fn new(
        http: reqwest::Client,
        base_url: url::Url,
        credentials: Arc<dyn CredentialManager>,
        account_id: u64,
    ) -> Self {
        Self {
            http,
            base_url,
            credentials,
            account_id,
        }
    }
}

/// State accumulated while walking one provider stream. Mirrors the
/// per-content-block bookkeeping an Anthropic-style stream consumer needs:
/// each open block has an index and a kind, and `message_delta` carries the
/// terminal stop reason separately from the per-block close events.
#[derive(Default)]
struct StreamState {
    text_open: bool,
    reasoning_open: bool,
    tool_open: Option<(u64, String)>,
    tool_json: String,
    saw_tool_call: bool,
    finished: bool,
}

#[async_trait]
impl UpstreamClient for SseClient {
    async fn send_request_with_payload(
        &self,
        request: &CanonicalRequest,
        on_event: &OnEvent<'_>,
    ) -> Result<(), GatewayError> {
        let credential = self
            .credentials
            .get(self.account_id)
            .await
            .map_err(|e| GatewayError::internal(format!("credential fetch failed: {e}")))?;

        let body = build_anthropic_body(request);

        let url = self
            .base_url
            .join("v1/messages")
            .map_err(|e| GatewayError::internal(format!("invalid upstream url: {e}")))?;

        let response = self
            .http
            .post(url)
            .bearer_auth(&credential.token)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::overloaded(format!("upstream request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::new(
                conduit_core::error::SurfaceCode::UpstreamError,
                format!("upstream returned {status}: {text}"),
            ));
        }

        let mut state = StreamState::default();
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::overloaded(format!("upstream stream error: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer.drain(..pos + 2);
                process_frame(&frame, &mut state, on_event);
                if state.finished {
                    break;
                }
            }
            if state.finished {
                break;
            }
        }

        if !state.finished {
            emit_finish(&mut state, on_event);
        }

        Ok(())
    }
}

fn process_frame(frame: &str, state: &mut StreamState, on_event: &OnEvent<'_>) {
    for line in frame.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            emit_finish(state, on_event);
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        handle_event(&event, state, on_event);
        if state.finished {
            return;
        }
    }
}

fn handle_event(event: &Value, state: &mut StreamState, on_event: &OnEvent<'_>) {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    match event_type {
        "content_block_start" => {
            let Some(block) = event.get("content_block") else { return };
            let block_type = block.get("type").and_then(Value::as_str).unwrap_or_default();
            match block_type {
                "text" => {
                    state.text_open = true;
                    on_event(NormalizedEvent::TextStart);
                }
                "thinking" => {
                    state.reasoning_open = true;
                    on_event(NormalizedEvent::ReasoningStart);
                }
                "tool_use" => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                    let index = event.get("index").and_then(Value::as_u64).unwrap_or_default();
                    state.tool_json.clear();
                    on_event(NormalizedEvent::ToolInputStart {
                        id: id.clone(),
                        tool_name: name.clone(),
                    });
                    state.tool_open = Some((index, id));
                }
                _ => {}
            }
        }
        "content_block_delta" => {
            let Some(delta) = event.get("delta") else { return };
            let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or_default();
            match delta_type {
                "text_delta" => {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        on_event(NormalizedEvent::TextDelta { text: text.to_string() });
                    }
                }
                "thinking_delta" => {
                    if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                        on_event(NormalizedEvent::ReasoningDelta { text: text.to_string() });
                    }
                }
                "signature_delta" => {
                    // Carried on reasoning_end instead; nothing to emit here.
                }
                "input_json_delta" => {
                    if let Some((_, id)) = &state.tool_open {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            state.tool_json.push_str(partial);
                            on_event(NormalizedEvent::ToolInputDelta {
                                id: id.clone(),
                                delta: partial.to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => {
            if state.text_open {
                state.text_open = false;
                on_event(NormalizedEvent::TextEnd);
            } else if state.reasoning_open {
                state.reasoning_open = false;
                on_event(NormalizedEvent::ReasoningEnd { signature: None });
            } else if let Some((_, id)) = state.tool_open.take() {
                on_event(NormalizedEvent::ToolInputEnd { id: id.clone() });
                let input: Value = serde_json::from_str(&state.tool_json).unwrap_or(Value::Null);
                state.saw_tool_call = true;
                on_event(NormalizedEvent::ToolCall {
                    id: Some(id),
                    name: String::new(),
                    input,
                });
            }
        }
        "message_delta" => {
            if let Some(usage) = event.get("usage") {
                let output = usage.get("output_tokens").and_then(Value::as_u64).map(|v| v as u32);
                if output.is_some() {
                    on_event(NormalizedEvent::TokensUsed { input: None, output });
                }
            }
            if let Some(delta) = event.get("delta") {
                if let Some(stop_reason) = delta.get("stop_reason").and_then(Value::as_str) {
                    state.saw_tool_call = state.saw_tool_call || stop_reason == "tool_use";
                }
            }
        }
        "message_start" => {
            if let Some(usage) = event.get("message").and_then(|m| m.get("usage")) {
                let input = usage.get("input_tokens").and_then(Value::as_u64).map(|v| v as u32);
                if input.is_some() {
                    on_event(NormalizedEvent::TokensUsed { input, output: None });
                }
            }
        }
        "message_stop" => {
            emit_finish(state, on_event);
        }
        "error" => {
            warn!(?event, "upstream emitted an error frame mid-stream");
            emit_finish(state, on_event);
        }
        _ => {}
    }
}

fn emit_finish(state: &mut StreamState, on_event: &OnEvent<'_>) {
    if state.finished {
        return;
    }
    state.finished = true;
    let reason = if state.saw_tool_call {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    };
    on_event(NormalizedEvent::Finish { reason });
}

fn build_anthropic_body(request: &CanonicalRequest) -> Value {
    let system: Vec<Value> = request
        .system
        .iter()
        .map(|s| {
            let mut block = json!({ "type": "text", "text": s.text });
            if s.cache_control.is_some() {
                block["cache_control"] = json!({ "type": "ephemeral" });
            }
            block
        })
        .collect();

    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                "content": content_to_json(&m.content),
            })
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": DEFAULT_MAX_TOKENS,
        "stream": true,
    });
    if !system.is_empty() {
        body["system"] = Value::Array(system);
    }
    if let Some(tools) = &request.tools {
        body["tools"] = json!(tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            }))
            .collect::<Vec<_>>());
    }
    body
}

fn content_to_json(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Blocks(blocks) => Value::Array(
            blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text, cache_control } => {
                        let mut v = json!({ "type": "text", "text": text });
                        if cache_control.is_some() {
                            v["cache_control"] = json!({ "type": "ephemeral" });
                        }
                        v
                    }
                    ContentBlock::Image { source } => json!({ "type": "image", "source": source }),
                    ContentBlock::Document { source } => json!({ "type": "document", "source": source }),
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({ "type": "tool_use", "id": id, "name": name, "input": input })
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let mut v = json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": content,
                        });
                        if *is_error {
                            v["is_error"] = json!(true);
                        }
                        v
                    }
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn text_delta_is_suppressed_outside_open_block() {
        let mut state = StreamState::default();
        let seen = RefCell::new(Vec::new());
        let on_event: &OnEvent<'_> = &|e| seen.borrow_mut().push(e);
        handle_event(
            &json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "hi"}}),
            &mut state,
            on_event,
        );
        assert!(matches!(seen.borrow().as_slice(), [NormalizedEvent::TextDelta { .. }]));
    }

    #[test]
    fn message_delta_with_tool_use_marks_tool_call_finish_reason() {
        let mut state = StreamState::default();
        let on_event: &OnEvent<'_> = &|_| {};
        handle_event(
            &json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
            &mut state,
            on_event,
        );
        assert!(state.saw_tool_call);
    }

    #[test]
    fn done_marker_emits_terminal_finish_once() {
        let mut state = StreamState::default();
        let finishes = RefCell::new(0);
        let on_event: &OnEvent<'_> = &|e| {
            if matches!(e, NormalizedEvent::Finish { .. }) {
                *finishes.borrow_mut() += 1;
            }
        };
        process_frame("data: [DONE]", &mut state, on_event);
        process_frame("data: [DONE]", &mut state, on_event);
        assert_eq!(*finishes.borrow(), 1);
    }

    #[test]
    fn build_anthropic_body_carries_system_and_tools() {
        let request = CanonicalRequest {
            model: "claude-3".into(),
            system: vec![conduit_core::request::SystemBlock {
                text: "be helpful".into(),
                cache_control: None,
            }],
            messages: vec![conduit_core::request::Message {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
            }],
            tools: None,
            stream: true,
            conversation_id: None,
        };
        let body = build_anthropic_body(&request);
        assert_eq!(body["model"], "claude-3");
        assert_eq!(body["system"][0]["text"], "be helpful");
    }
}
