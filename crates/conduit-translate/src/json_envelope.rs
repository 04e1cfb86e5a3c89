//! Buffers a full [`TranslatedEvent`] sequence into a single non-streaming
//! JSON response, for callers that didn't ask for `stream: true`.

use std::collections::HashMap;

use conduit_core::event::FinishReason;
use serde_json::{json, Value};

use crate::translator::{BlockDelta, BlockStartKind, TranslatedEvent};

enum OpenEntry {
    Text(String),
    Thinking(String),
    Tool { id: String, name: String, json: String },
}

enum FinishedBlock {
    Text(String),
    Thinking(String, Option<String>),
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Default)]
pub struct NonStreamingCollector {
    open: HashMap<u32, OpenEntry>,
    finished: Vec<FinishedBlock>,
    stop_reason: Option<FinishReason>,
    tokens_input: Option<u32>,
    tokens_output: Option<u32>,
}

impl NonStreamingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, event: &TranslatedEvent) {
        match event {
            TranslatedEvent::ContentBlockStart { index, kind } => {
                let entry = match kind {
                    BlockStartKind::Text => OpenEntry::Text(String::new()),
                    BlockStartKind::Thinking => OpenEntry::Thinking(String::new()),
                    BlockStartKind::ToolUse { id, name } => OpenEntry::Tool {
                        id: id.clone(),
                        name: name.clone(),
                        json: String::new(),
                    },
                };
                self.open.insert(*index, entry);
            }
            TranslatedEvent::ContentBlockDelta { index, delta } => {
                if let Some(entry) = self.open.get_mut(index) {
                    match (entry, delta) {
                        (OpenEntry::Text(buf), BlockDelta::Text(text)) => buf.push_str(text),
                        (OpenEntry::Thinking(buf), BlockDelta::Thinking(text)) => buf.push_str(text),
                        (OpenEntry::Tool { json, .. }, BlockDelta::ToolInputJson(partial)) => json.push_str(partial),
                        _ => {}
                    }
                }
            }
            TranslatedEvent::ContentBlockStop { index, signature } => {
                if let Some(entry) = self.open.remove(index) {
                    let finished = match entry {
                        OpenEntry::Text(text) => FinishedBlock::Text(text),
                        OpenEntry::Thinking(text) => FinishedBlock::Thinking(text, signature.clone()),
                        OpenEntry::Tool { id, name, json } => FinishedBlock::ToolUse {
                            id,
                            name,
                            input: serde_json::from_str(&json).unwrap_or(Value::Null),
                        },
                    };
                    self.finished.push(finished);
                }
            }
            TranslatedEvent::TokensUsed { input, output } => {
                if let Some(v) = input {
                    self.tokens_input = Some(*v);
                }
                if let Some(v) = output {
                    self.tokens_output = Some(*v);
                }
            }
            TranslatedEvent::MessageDelta { stop_reason } => self.stop_reason = Some(*stop_reason),
            TranslatedEvent::MessageStop | TranslatedEvent::FsOperation { .. } | TranslatedEvent::KeepAlive => {}
        }
    }

    pub fn into_anthropic_json(self, id: String, model: String) -> Value {
        let stop_reason = self.stop_reason.unwrap_or(FinishReason::Stop);
        let content: Vec<Value> = self
            .finished
            .iter()
            .map(|b| match b {
                FinishedBlock::Text(text) => json!({"type": "text", "text": text}),
                FinishedBlock::Thinking(text, signature) => {
                    let mut block = json!({"type": "thinking", "thinking": text});
                    if let Some(signature) = signature {
                        block["signature"] = json!(signature);
                    }
                    block
                }
                FinishedBlock::ToolUse { id, name, input } => {
                    json!({"type": "tool_use", "id": id, "name": name, "input": input})
                }
            })
            .collect();
        json!({
            "id": id,
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": content,
            "stop_reason": stop_reason.as_anthropic_stop_reason(),
            "usage": {
                "input_tokens": self.tokens_input.unwrap_or_default(),
                "output_tokens": self.tokens_output.unwrap_or_default(),
            },
        })
    }

    pub fn into_openai_json(self, id: String, model: String, created: i64) -> Value {
        let stop_reason = self.stop_reason.unwrap_or(FinishReason::Stop);
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &self.finished {
            match block {
                FinishedBlock::Text(t) => text.push_str(t),
                FinishedBlock::Thinking(_, _) => {}
                FinishedBlock::ToolUse { id, name, input } => {
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input.to_string()},
                    }));
                }
            }
        }
        let mut message = json!({"role": "assistant", "content": text});
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }
        let prompt = self.tokens_input.unwrap_or_default();
        let completion = self.tokens_output.unwrap_or_default();
        json!({
            "id": id,
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": crate::openai_sse::finish_reason_for(stop_reason),
            }],
            "usage": {
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": prompt + completion,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_text_across_multiple_deltas() {
        let mut collector = NonStreamingCollector::new();
        collector.feed(&TranslatedEvent::ContentBlockStart { index: 0, kind: BlockStartKind::Text });
        collector.feed(&TranslatedEvent::ContentBlockDelta { index: 0, delta: BlockDelta::Text("hello ".into()) });
        collector.feed(&TranslatedEvent::ContentBlockDelta { index: 0, delta: BlockDelta::Text("world".into()) });
        collector.feed(&TranslatedEvent::ContentBlockStop { index: 0, signature: None });
        let body = collector.into_anthropic_json("id".into(), "model".into());
        assert_eq!(body["content"][0]["text"], "hello world");
    }

    #[test]
    fn thinking_block_carries_its_signature_into_the_buffered_body() {
        let mut collector = NonStreamingCollector::new();
        collector.feed(&TranslatedEvent::ContentBlockStart { index: 0, kind: BlockStartKind::Thinking });
        collector.feed(&TranslatedEvent::ContentBlockDelta { index: 0, delta: BlockDelta::Thinking("because...".into()) });
        collector.feed(&TranslatedEvent::ContentBlockStop { index: 0, signature: Some("sig-xyz".into()) });
        let body = collector.into_anthropic_json("id".into(), "model".into());
        assert_eq!(body["content"][0]["signature"], "sig-xyz");
    }

    #[test]
    fn tool_use_input_is_parsed_from_accumulated_json() {
        let mut collector = NonStreamingCollector::new();
        collector.feed(&TranslatedEvent::ContentBlockStart {
            index: 0,
            kind: BlockStartKind::ToolUse { id: "1".into(), name: "Bash".into() },
        });
        collector.feed(&TranslatedEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::ToolInputJson(r#"{"command":"ls"}"#.into()),
        });
        collector.feed(&TranslatedEvent::ContentBlockStop { index: 0, signature: None });
        let body = collector.into_openai_json("id".into(), "model".into(), 0);
        assert_eq!(body["choices"][0]["message"]["tool_calls"][0]["function"]["name"], "Bash");
    }
}
