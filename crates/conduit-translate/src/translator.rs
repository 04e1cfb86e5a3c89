//! The dialect-agnostic stream state machine: consumes [`NormalizedEvent`]s
//! from an upstream client and produces [`TranslatedEvent`]s, which
//! [`crate::anthropic_sse`] or [`crate::openai_sse`] then render onto the
//! wire. All tool-call validation, deduplication, and block bookkeeping
//! lives here so both renderers stay dumb formatters.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use conduit_core::event::{FinishReason, NormalizedEvent};
use regex::Regex;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlockKind {
    Text,
    Reasoning,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolStatus {
    Sealed,
    Rejected,
}

#[derive(Debug, Clone)]
pub enum BlockStartKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone)]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    ToolInputJson(String),
}

/// One unit of output, dialect-agnostic. A renderer turns a sequence of
/// these into SSE frames (or a single buffered JSON body).
#[derive(Debug, Clone)]
pub enum TranslatedEvent {
    ContentBlockStart { index: u32, kind: BlockStartKind },
    ContentBlockDelta { index: u32, delta: BlockDelta },
    ContentBlockStop { index: u32, signature: Option<String> },
    TokensUsed { input: Option<u32>, output: Option<u32> },
    MessageDelta { stop_reason: FinishReason },
    MessageStop,
    FsOperation { payload: Value },
    KeepAlive,
}

fn greeting_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            ("en", Regex::new(r"(?i)^\s*hello[!.]?\s*i'?m\s+an?\s+ai\b").unwrap()),
            ("en", Regex::new(r"(?i)^\s*hi[!.]?\s*how can i help\b").unwrap()),
            ("es", Regex::new(r"(?i)^\s*hola[!.]?\s*soy\s+un[ao]?\s+ia\b").unwrap()),
        ]
    })
}

/// Normalizes a matched greeting to a stable dedup/suppression key.
fn canonical_greeting_key(text: &str) -> Option<String> {
    greeting_patterns()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(lang, _)| format!("intro:{lang}:greet"))
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn hash_value(v: &Value) -> u64 {
    hash_str(&v.to_string())
}

/// Side-effect tools get a dedup key built from their critical fields;
/// read-only tools (Read, Grep, Glob, ...) are never deduplicated.
fn dedup_key(name: &str, input: &Value) -> Option<String> {
    match name {
        "Bash" => input
            .get("command")
            .or_else(|| input.get("cmd"))
            .and_then(Value::as_str)
            .map(|c| format!("bash:{c}")),
        "Write" => {
            let file_path = input.get("file_path").and_then(Value::as_str)?;
            let content = input.get("content").and_then(Value::as_str).unwrap_or("");
            Some(format!("write:{file_path}\u{0}{:x}", hash_str(content)))
        }
        "Edit" => {
            let file_path = input.get("file_path").and_then(Value::as_str)?;
            let old = input.get("old_string").and_then(Value::as_str).unwrap_or("");
            let new = input.get("new_string").and_then(Value::as_str).unwrap_or("");
            Some(format!("edit:{file_path}\u{0}{:x}\u{0}{:x}", hash_str(old), hash_str(new)))
        }
        _ => None,
    }
}

fn validate_tool_input(name: &str, input: &Value) -> bool {
    match name {
        "Write" => {
            input.get("file_path").and_then(Value::as_str).is_some_and(|s| !s.is_empty())
                && input.get("content").is_some()
        }
        "Edit" => ["file_path", "old_string", "new_string"]
            .iter()
            .all(|k| input.get(*k).and_then(Value::as_str).is_some()),
        "Bash" => input
            .get("command")
            .or_else(|| input.get("cmd"))
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty()),
        _ => !input.is_null(),
    }
}

pub struct StreamTranslator {
    open_blocks: BTreeMap<u32, OpenBlockKind>,
    next_index: u32,
    tool_ids: HashMap<String, ToolStatus>,
    dedup_keys: HashSet<String>,
    tool_input_buffers: HashMap<String, String>,
    tool_input_index: HashMap<String, u32>,
    tool_input_names: HashMap<String, String>,
    tokens_input: Option<u32>,
    tokens_output: Option<u32>,
    conversation_id: Option<String>,
    fs_last_emitted: HashMap<String, Instant>,
    last_activity: Instant,
    keepalive_interval: Duration,
    saw_tool_call: bool,
    finished: bool,
    /// Buffers the very first text block so it can be checked against the
    /// canonical-greeting patterns before any of it reaches the wire.
    first_text_buffer: Option<String>,
    first_text_decided: bool,
}

impl StreamTranslator {
    pub fn new(keepalive_interval: Duration) -> Self {
        Self {
            open_blocks: BTreeMap::new(),
            next_index: 0,
            tool_ids: HashMap::new(),
            dedup_keys: HashSet::new(),
            tool_input_buffers: HashMap::new(),
            tool_input_index: HashMap::new(),
            tool_input_names: HashMap::new(),
            tokens_input: None,
            tokens_output: None,
            conversation_id: None,
            fs_last_emitted: HashMap::new(),
            last_activity: Instant::now(),
            keepalive_interval,
            saw_tool_call: false,
            finished: false,
            first_text_buffer: None,
            first_text_decided: false,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Most recently observed input/output token counts, for the pipeline to
    /// fold into the dispatching account's usage stats once the stream ends.
    pub fn tokens(&self) -> (Option<u32>, Option<u32>) {
        (self.tokens_input, self.tokens_output)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn allocate_index(&mut self, kind: OpenBlockKind) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        self.open_blocks.insert(index, kind);
        index
    }

    /// Call once per idle tick; emits a keep-alive comment if the stream has
    /// gone quiet and hasn't finished.
    pub fn tick(&mut self, now: Instant) -> Option<TranslatedEvent> {
        if self.finished {
            return None;
        }
        if now.duration_since(self.last_activity) >= self.keepalive_interval {
            self.last_activity = now;
            return Some(TranslatedEvent::KeepAlive);
        }
        None
    }

    pub fn handle(&mut self, event: NormalizedEvent, now: Instant) -> Vec<TranslatedEvent> {
        self.last_activity = now;
        match event {
            NormalizedEvent::TextStart => self.handle_text_start(),
            NormalizedEvent::TextDelta { text } => self.handle_text_delta(text),
            NormalizedEvent::TextEnd => self.handle_text_end(),
            NormalizedEvent::ReasoningStart => {
                let index = self.allocate_index(OpenBlockKind::Reasoning);
                vec![TranslatedEvent::ContentBlockStart {
                    index,
                    kind: BlockStartKind::Thinking,
                }]
            }
            NormalizedEvent::ReasoningDelta { text } => {
                let Some((&index, _)) = self.open_blocks.iter().find(|(_, k)| **k == OpenBlockKind::Reasoning) else {
                    return vec![];
                };
                vec![TranslatedEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::Thinking(text),
                }]
            }
            NormalizedEvent::ReasoningEnd { signature } => {
                let index = self.close_first(OpenBlockKind::Reasoning);
                index
                    .map(|index| vec![TranslatedEvent::ContentBlockStop { index, signature }])
                    .unwrap_or_default()
            }
            NormalizedEvent::ToolInputStart { id, tool_name } => {
                let index = self.allocate_index(OpenBlockKind::Tool);
                self.tool_input_index.insert(id.clone(), index);
                self.tool_input_buffers.insert(id.clone(), String::new());
                self.tool_input_names.insert(id.clone(), tool_name.clone());
                vec![TranslatedEvent::ContentBlockStart {
                    index,
                    kind: BlockStartKind::ToolUse { id, name: tool_name },
                }]
            }
            NormalizedEvent::ToolInputDelta { id, delta } => {
                let Some(&index) = self.tool_input_index.get(&id) else {
                    return vec![];
                };
                self.tool_input_buffers.entry(id).or_default().push_str(&delta);
                vec![TranslatedEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ToolInputJson(delta),
                }]
            }
            NormalizedEvent::ToolInputEnd { id } => self.handle_tool_input_end(id),
            NormalizedEvent::ToolCall { id, name, input } => self.handle_tool_call(id, name, input),
            NormalizedEvent::TokensUsed { input, output } => {
                if let Some(v) = input {
                    self.tokens_input = Some(v);
                }
                if let Some(v) = output {
                    self.tokens_output = Some(v);
                }
                vec![TranslatedEvent::TokensUsed {
                    input: self.tokens_input,
                    output: self.tokens_output,
                }]
            }
            NormalizedEvent::ConversationId { id } => {
                self.conversation_id = Some(id);
                vec![]
            }
            NormalizedEvent::FsOperation { kind, payload } => {
                let last = self.fs_last_emitted.get(&kind);
                if last.is_some_and(|t| now.duration_since(*t) < Duration::from_secs(1)) {
                    return vec![];
                }
                self.fs_last_emitted.insert(kind, now);
                vec![TranslatedEvent::FsOperation { payload }]
            }
            NormalizedEvent::Finish { reason } => self.handle_finish(reason),
            NormalizedEvent::Opaque { .. } => vec![],
        }
    }

    fn close_first(&mut self, kind: OpenBlockKind) -> Option<u32> {
        let index = *self.open_blocks.iter().find(|(_, k)| **k == kind)?.0;
        self.open_blocks.remove(&index);
        Some(index)
    }

    fn handle_text_start(&mut self) -> Vec<TranslatedEvent> {
        if !self.first_text_decided && self.open_blocks.is_empty() && self.next_index == 0 {
            self.first_text_buffer = Some(String::new());
            return vec![];
        }
        let index = self.allocate_index(OpenBlockKind::Text);
        vec![TranslatedEvent::ContentBlockStart { index, kind: BlockStartKind::Text }]
    }

    fn handle_text_delta(&mut self, text: String) -> Vec<TranslatedEvent> {
        if let Some(buffer) = &mut self.first_text_buffer {
            buffer.push_str(&text);
            return vec![];
        }
        let Some((&index, _)) = self.open_blocks.iter().find(|(_, k)| **k == OpenBlockKind::Text) else {
            return vec![];
        };
        vec![TranslatedEvent::ContentBlockDelta { index, delta: BlockDelta::Text(text) }]
    }

    fn handle_text_end(&mut self) -> Vec<TranslatedEvent> {
        if let Some(buffer) = self.first_text_buffer.take() {
            self.first_text_decided = true;
            if canonical_greeting_key(&buffer).is_some() {
                // Suppressed entirely: no block ever existed on the wire.
                return vec![];
            }
            let index = self.allocate_index(OpenBlockKind::Text);
            return vec![
                TranslatedEvent::ContentBlockStart { index, kind: BlockStartKind::Text },
                TranslatedEvent::ContentBlockDelta { index, delta: BlockDelta::Text(buffer) },
                TranslatedEvent::ContentBlockStop { index, signature: None },
            ];
        }
        self.first_text_decided = true;
        let index = self.close_first(OpenBlockKind::Text);
        index
            .map(|index| vec![TranslatedEvent::ContentBlockStop { index, signature: None }])
            .unwrap_or_default()
    }

    fn handle_tool_input_end(&mut self, id: String) -> Vec<TranslatedEvent> {
        let Some(index) = self.tool_input_index.remove(&id) else {
            return vec![];
        };
        self.open_blocks.remove(&index);
        let json_text = self.tool_input_buffers.remove(&id).unwrap_or_default();
        let name = self.tool_input_names.remove(&id).unwrap_or_default();
        let input: Value = serde_json::from_str(&json_text).unwrap_or(Value::Null);

        if !validate_tool_input(&name, &input) {
            self.tool_ids.insert(id, ToolStatus::Rejected);
            return vec![TranslatedEvent::ContentBlockStop { index, signature: None }];
        }
        if let Some(key) = dedup_key(&name, &input) {
            if !self.dedup_keys.insert(key) {
                self.tool_ids.insert(id, ToolStatus::Rejected);
                return vec![TranslatedEvent::ContentBlockStop { index, signature: None }];
            }
        }
        self.tool_ids.insert(id, ToolStatus::Sealed);
        self.saw_tool_call = true;
        vec![TranslatedEvent::ContentBlockStop { index, signature: None }]
    }

    fn handle_tool_call(&mut self, id: Option<String>, name: String, input: Value) -> Vec<TranslatedEvent> {
        let id = id.unwrap_or_else(|| format!("synth_{name}_{:x}", hash_value(&input)));

        match self.tool_ids.get(&id) {
            Some(ToolStatus::Sealed) => return vec![],
            Some(ToolStatus::Rejected) | None => {}
        }

        if !validate_tool_input(&name, &input) {
            self.tool_ids.insert(id, ToolStatus::Rejected);
            return vec![];
        }
        if let Some(key) = dedup_key(&name, &input) {
            if !self.dedup_keys.insert(key) {
                return vec![];
            }
        }

        self.tool_ids.insert(id.clone(), ToolStatus::Sealed);
        self.saw_tool_call = true;
        let index = self.allocate_index(OpenBlockKind::Tool);
        self.open_blocks.remove(&index);
        vec![
            TranslatedEvent::ContentBlockStart { index, kind: BlockStartKind::ToolUse { id, name } },
            TranslatedEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::ToolInputJson(serde_json::to_string(&input).unwrap_or_default()),
            },
            TranslatedEvent::ContentBlockStop { index, signature: None },
        ]
    }

    fn handle_finish(&mut self, reason: FinishReason) -> Vec<TranslatedEvent> {
        if self.finished {
            return vec![];
        }
        self.finished = true;
        let mut events = Vec::new();
        for (&index, _) in self.open_blocks.clone().iter() {
            events.push(TranslatedEvent::ContentBlockStop { index, signature: None });
        }
        self.open_blocks.clear();
        let reason = if self.saw_tool_call { FinishReason::ToolCalls } else { reason };
        events.push(TranslatedEvent::MessageDelta { stop_reason: reason });
        events.push(TranslatedEvent::MessageStop);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn text_block_opens_and_closes() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        // First text block goes through the greeting buffer; feed enough
        // text that it won't match a greeting pattern.
        t.handle(NormalizedEvent::TextStart, now());
        let events = t.handle(NormalizedEvent::TextDelta { text: "the answer is 42".into() }, now());
        assert!(events.is_empty(), "first block is buffered pending greeting check");
        let events = t.handle(NormalizedEvent::TextEnd, now());
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn canonical_greeting_is_suppressed() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        t.handle(NormalizedEvent::TextStart, now());
        t.handle(NormalizedEvent::TextDelta { text: "Hello! I'm an AI assistant.".into() }, now());
        let events = t.handle(NormalizedEvent::TextEnd, now());
        assert!(events.is_empty());
    }

    #[test]
    fn duplicate_tool_call_with_same_dedup_key_is_dropped() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        let input = serde_json::json!({"command": "ls"});
        let first = t.handle(
            NormalizedEvent::ToolCall { id: Some("1".into()), name: "Bash".into(), input: input.clone() },
            now(),
        );
        assert_eq!(first.len(), 3);
        let second = t.handle(
            NormalizedEvent::ToolCall { id: Some("2".into()), name: "Bash".into(), input },
            now(),
        );
        assert!(second.is_empty());
    }

    #[test]
    fn invalid_tool_input_is_rejected_and_not_emitted() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        let events = t.handle(
            NormalizedEvent::ToolCall {
                id: Some("1".into()),
                name: "Write".into(),
                input: serde_json::json!({"file_path": "a.txt"}),
            },
            now(),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn fs_operation_is_throttled_per_kind() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        let t0 = now();
        let events = t.handle(
            NormalizedEvent::FsOperation { kind: "read".into(), payload: serde_json::json!({}) },
            t0,
        );
        assert_eq!(events.len(), 1);
        let events = t.handle(
            NormalizedEvent::FsOperation { kind: "read".into(), payload: serde_json::json!({}) },
            t0 + Duration::from_millis(100),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn finish_is_emitted_only_once() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        let first = t.handle(NormalizedEvent::Finish { reason: FinishReason::Stop }, now());
        assert!(matches!(first.last(), Some(TranslatedEvent::MessageStop)));
        let second = t.handle(NormalizedEvent::Finish { reason: FinishReason::Stop }, now());
        assert!(second.is_empty());
    }

    #[test]
    fn reasoning_end_signature_reaches_the_content_block_stop() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        t.handle(NormalizedEvent::ReasoningStart, now());
        let events = t.handle(NormalizedEvent::ReasoningEnd { signature: Some("sig-abc".into()) }, now());
        let stop = events.iter().find_map(|e| match e {
            TranslatedEvent::ContentBlockStop { signature, .. } => Some(signature.clone()),
            _ => None,
        });
        assert_eq!(stop, Some(Some("sig-abc".to_string())));
    }

    #[test]
    fn finish_reason_upgrades_to_tool_calls_when_a_tool_ran() {
        let mut t = StreamTranslator::new(Duration::from_secs(15));
        t.handle(
            NormalizedEvent::ToolCall { id: Some("1".into()), name: "Bash".into(), input: serde_json::json!({"command": "ls"}) },
            now(),
        );
        let events = t.handle(NormalizedEvent::Finish { reason: FinishReason::Stop }, now());
        let delta = events.iter().find_map(|e| match e {
            TranslatedEvent::MessageDelta { stop_reason } => Some(*stop_reason),
            _ => None,
        });
        assert_eq!(delta, Some(FinishReason::ToolCalls));
    }
}
