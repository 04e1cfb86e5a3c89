//! Renders [`TranslatedEvent`]s as Anthropic Messages API SSE frames.

use serde_json::json;

use crate::translator::{BlockDelta, BlockStartKind, TranslatedEvent};

/// One rendered SSE frame: `event: <name>\ndata: <json>\n\n`, or a bare
/// comment for keep-alive.
pub fn render(event: &TranslatedEvent) -> Option<String> {
    match event {
        TranslatedEvent::ContentBlockStart { index, kind } => {
            let content_block = match kind {
                BlockStartKind::Text => json!({"type": "text", "text": ""}),
                BlockStartKind::Thinking => json!({"type": "thinking", "thinking": ""}),
                BlockStartKind::ToolUse { id, name } => json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
            };
            Some(frame(
                "content_block_start",
                &json!({"type": "content_block_start", "index": index, "content_block": content_block}),
            ))
        }
        TranslatedEvent::ContentBlockDelta { index, delta } => {
            let delta = match delta {
                BlockDelta::Text(text) => json!({"type": "text_delta", "text": text}),
                BlockDelta::Thinking(text) => json!({"type": "thinking_delta", "thinking": text}),
                BlockDelta::ToolInputJson(partial) => json!({"type": "input_json_delta", "partial_json": partial}),
            };
            Some(frame(
                "content_block_delta",
                &json!({"type": "content_block_delta", "index": index, "delta": delta}),
            ))
        }
        TranslatedEvent::ContentBlockStop { index, signature } => {
            let mut body = json!({"type": "content_block_stop", "index": index});
            if let Some(signature) = signature {
                body["signature"] = json!(signature);
            }
            Some(frame("content_block_stop", &body))
        }
        TranslatedEvent::TokensUsed { input, output } => Some(frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {},
                "usage": {"input_tokens": input, "output_tokens": output},
            }),
        )),
        TranslatedEvent::MessageDelta { stop_reason } => Some(frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason.as_anthropic_stop_reason()},
            }),
        )),
        TranslatedEvent::MessageStop => Some(frame("message_stop", &json!({"type": "message_stop"}))),
        TranslatedEvent::FsOperation { payload } => Some(frame("fs_operation", payload)),
        TranslatedEvent::KeepAlive => Some(": keep-alive\n\n".to_string()),
    }
}

fn frame(event_name: &str, data: &serde_json::Value) -> String {
    format!("event: {event_name}\ndata: {data}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_renders_as_bare_comment() {
        assert_eq!(render(&TranslatedEvent::KeepAlive), Some(": keep-alive\n\n".to_string()));
    }

    #[test]
    fn content_block_start_carries_index_and_type() {
        let rendered = render(&TranslatedEvent::ContentBlockStart { index: 0, kind: BlockStartKind::Text }).unwrap();
        assert!(rendered.contains("event: content_block_start"));
        assert!(rendered.contains("\"index\":0"));
    }

    #[test]
    fn content_block_stop_carries_reasoning_signature_when_present() {
        let rendered = render(&TranslatedEvent::ContentBlockStop { index: 0, signature: Some("sig-123".into()) }).unwrap();
        assert!(rendered.contains("\"signature\":\"sig-123\""));

        let rendered = render(&TranslatedEvent::ContentBlockStop { index: 0, signature: None }).unwrap();
        assert!(!rendered.contains("signature"));
    }
}
