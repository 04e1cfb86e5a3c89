//! Renders [`TranslatedEvent`]s as OpenAI `chat.completion.chunk` SSE frames.
//!
//! OpenAI's wire shape has no notion of a content block, so tool-use blocks
//! are remapped onto the `choices[0].delta.tool_calls[].index` sequence the
//! dialect expects, tracked here rather than reusing the translator's block
//! index.

use std::collections::HashMap;

use conduit_core::event::FinishReason;
use serde_json::json;

use crate::translator::{BlockDelta, BlockStartKind, TranslatedEvent};

pub struct OpenAiRenderer {
    id: String,
    model: String,
    created: i64,
    tool_call_indices: HashMap<u32, u32>,
    next_tool_call_index: u32,
}

impl OpenAiRenderer {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            tool_call_indices: HashMap::new(),
            next_tool_call_index: 0,
        }
    }

    fn chunk(&self, delta: serde_json::Value, finish_reason: Option<&str>) -> String {
        let body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        });
        format!("data: {body}\n\n")
    }

    pub fn render(&mut self, event: &TranslatedEvent) -> Option<String> {
        match event {
            TranslatedEvent::ContentBlockStart { index, kind } => match kind {
                BlockStartKind::Text | BlockStartKind::Thinking => None,
                BlockStartKind::ToolUse { id, name } => {
                    let tool_index = self.next_tool_call_index;
                    self.next_tool_call_index += 1;
                    self.tool_call_indices.insert(*index, tool_index);
                    Some(self.chunk(
                        json!({
                            "tool_calls": [{
                                "index": tool_index,
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": ""},
                            }],
                        }),
                        None,
                    ))
                }
            },
            TranslatedEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::Text(text) => Some(self.chunk(json!({"content": text}), None)),
                BlockDelta::Thinking(text) => Some(self.chunk(json!({"reasoning_content": text}), None)),
                BlockDelta::ToolInputJson(partial) => {
                    let tool_index = *self.tool_call_indices.get(index)?;
                    Some(self.chunk(
                        json!({"tool_calls": [{"index": tool_index, "function": {"arguments": partial}}]}),
                        None,
                    ))
                }
            },
            TranslatedEvent::ContentBlockStop { index, signature: _ } => {
                self.tool_call_indices.remove(index);
                None
            }
            TranslatedEvent::TokensUsed { input, output } => {
                let prompt = input.unwrap_or_default();
                let completion = output.unwrap_or_default();
                let body = json!({
                    "id": self.id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [],
                    "usage": {
                        "prompt_tokens": prompt,
                        "completion_tokens": completion,
                        "total_tokens": prompt + completion,
                    },
                });
                Some(format!("data: {body}\n\n"))
            }
            TranslatedEvent::MessageDelta { stop_reason } => {
                Some(self.chunk(json!({}), Some(finish_reason_for(*stop_reason))))
            }
            TranslatedEvent::MessageStop => Some("data: [DONE]\n\n".to_string()),
            TranslatedEvent::FsOperation { payload } => {
                Some(format!("data: {}\n\n", json!({"object": "fs_operation", "payload": payload})))
            }
            TranslatedEvent::KeepAlive => Some(": keep-alive\n\n".to_string()),
        }
    }
}

pub fn finish_reason_for(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::Other => "stop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_start_allocates_sequential_tool_call_index() {
        let mut r = OpenAiRenderer::new("id", "model", 0);
        let first = r
            .render(&TranslatedEvent::ContentBlockStart {
                index: 0,
                kind: BlockStartKind::ToolUse { id: "a".into(), name: "Bash".into() },
            })
            .unwrap();
        assert!(first.contains("\"index\":0"));

        let second = r
            .render(&TranslatedEvent::ContentBlockStart {
                index: 5,
                kind: BlockStartKind::ToolUse { id: "b".into(), name: "Edit".into() },
            })
            .unwrap();
        assert!(second.contains("\"index\":1"));
    }

    #[test]
    fn message_stop_renders_done_marker() {
        let mut r = OpenAiRenderer::new("id", "model", 0);
        assert_eq!(r.render(&TranslatedEvent::MessageStop), Some("data: [DONE]\n\n".to_string()));
    }

    #[test]
    fn finish_reason_maps_tool_calls() {
        let mut r = OpenAiRenderer::new("id", "model", 0);
        let rendered = r
            .render(&TranslatedEvent::MessageDelta { stop_reason: FinishReason::ToolCalls })
            .unwrap();
        assert!(rendered.contains("\"finish_reason\":\"tool_calls\""));
    }
}
