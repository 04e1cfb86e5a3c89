//! The canonical upstream request shape that every provider-specific wire
//! dialect is translated into before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A system-prompt block, carried separately from the message list so cache
/// control can be attached per-block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheControl {
    Ephemeral,
}

/// One typed piece of message content. `Image`/`Document` carry their source
/// as an opaque JSON value since the core never decodes media payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: Value,
    },
    Document {
        source: Value,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// A message's content: either a plain string or an ordered sequence of
/// typed blocks. Mirrors the two shapes both wire dialects accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn last_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s.as_str()),
            MessageContent::Blocks(blocks) => blocks.iter().rev().find_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A request normalized from either wire dialect, ready for a provider
/// translator to turn into that upstream's own wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    #[serde(default)]
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl CanonicalRequest {
    /// True when the request is eligible for dispatch: non-empty messages
    /// ending in a `user` turn.
    pub fn is_eligible_for_dispatch(&self) -> bool {
        matches!(self.messages.last(), Some(m) if m.role == Role::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligible_requires_trailing_user_message() {
        let mut req = CanonicalRequest {
            model: "m".into(),
            system: vec![],
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
            }],
            tools: None,
            stream: false,
            conversation_id: None,
        };
        assert!(req.is_eligible_for_dispatch());

        req.messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Text("hello".into()),
        });
        assert!(!req.is_eligible_for_dispatch());
    }

    #[test]
    fn last_text_finds_trailing_text_block() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::ToolUse {
                id: "1".into(),
                name: "Bash".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::Text {
                text: "done".into(),
                cache_control: None,
            },
        ]);
        assert_eq!(content.last_text(), Some("done"));
    }
}
