//! The closed set of normalized events every upstream client emits. The
//! translator (`conduit-translate`) is the only consumer; upstream clients
//! are the only producers.

use serde_json::Value;

/// A tagged event produced by an upstream client, already stripped of
/// provider-specific framing.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    TextStart,
    TextDelta { text: String },
    TextEnd,
    ReasoningStart,
    ReasoningDelta { text: String },
    ReasoningEnd { signature: Option<String> },
    ToolInputStart { id: String, tool_name: String },
    ToolInputDelta { id: String, delta: String },
    ToolInputEnd { id: String },
    /// A tool call delivered complete in a single frame, rather than built up
    /// through `ToolInput*`.
    ToolCall {
        id: Option<String>,
        name: String,
        input: Value,
    },
    TokensUsed {
        input: Option<u32>,
        output: Option<u32>,
    },
    ConversationId {
        id: String,
    },
    FsOperation {
        kind: String,
        payload: Value,
    },
    Finish {
        reason: FinishReason,
    },
    /// Provider-specific frame the translator intentionally drops or
    /// forwards verbatim as a keep-alive comment.
    Opaque { raw: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

impl FinishReason {
    /// Maps to the Anthropic `stop_reason` vocabulary used by `message_delta`.
    pub fn as_anthropic_stop_reason(self) -> &'static str {
        match self {
            FinishReason::ToolCalls => "tool_use",
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::Other => "end_turn",
        }
    }
}
