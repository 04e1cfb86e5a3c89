//! Request fingerprinting (for dedup) and conversation-key resolution (for
//! session lookup).

use std::collections::HashMap;
use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Metadata keys, checked in order, that may carry an explicit conversation
/// id inside the request body.
const METADATA_KEYS: &[&str] = &[
    "conversation_id",
    "conversationId",
    "session_id",
    "sessionId",
    "thread_id",
    "threadId",
    "chat_id",
    "chatId",
];

/// Header names, checked in order, that may carry an explicit conversation
/// id when the body doesn't.
const HEADER_NAMES: &[&str] = &["x-conversation-id", "x-session-id", "x-thread-id", "x-chat-id"];

/// Stable hash of (normalized path, authorization header, verbatim body),
/// used as the dedup store key. Stable across process restarts: SipHash with
/// fixed keys, not `RandomState`.
pub fn fingerprint(path: &str, authorization: Option<&str>, body: &[u8]) -> String {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(normalize_path(path).as_bytes());
    hasher.write_u8(0);
    hasher.write(authorization.unwrap_or("").as_bytes());
    hasher.write_u8(0);
    hasher.write(body);
    format!("{:016x}", hasher.finish())
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolves the conversation key: first non-empty of the body's
/// `conversation_id`, the recognized metadata keys, then the recognized
/// header names. Returns `None` if nothing is present, signaling callers to
/// synthesize a key (e.g. from remote address) that must never be persisted
/// as an explicit session key.
pub fn resolve_conversation_key(body: &serde_json::Value, headers: &HashMap<String, String>) -> Option<String> {
    if let Some(id) = body.get("conversation_id").and_then(|v| v.as_str()) {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    let metadata = body.get("metadata");
    for key in METADATA_KEYS {
        if let Some(id) = metadata.and_then(|m| m.get(key)).and_then(|v| v.as_str()) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    for name in HEADER_NAMES {
        if let Some(id) = headers.get(*name) {
            if !id.is_empty() {
                return Some(id.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_sensitive_to_each_input() {
        let a = fingerprint("/v1/messages", Some("Bearer x"), b"{}");
        let b = fingerprint("/v1/messages", Some("Bearer x"), b"{}");
        assert_eq!(a, b);

        let different_path = fingerprint("/v1/other", Some("Bearer x"), b"{}");
        assert_ne!(a, different_path);

        let different_auth = fingerprint("/v1/messages", Some("Bearer y"), b"{}");
        assert_ne!(a, different_auth);

        let different_body = fingerprint("/v1/messages", Some("Bearer x"), b"{\"a\":1}");
        assert_ne!(a, different_body);
    }

    #[test]
    fn trailing_slash_does_not_change_fingerprint() {
        let a = fingerprint("/v1/messages/", None, b"{}");
        let b = fingerprint("/v1/messages", None, b"{}");
        assert_eq!(a, b);
    }

    #[test]
    fn conversation_key_prefers_body_over_headers() {
        let body = serde_json::json!({"conversation_id": "from-body"});
        let mut headers = HashMap::new();
        headers.insert("x-conversation-id".to_string(), "from-header".to_string());
        assert_eq!(resolve_conversation_key(&body, &headers), Some("from-body".to_string()));
    }

    #[test]
    fn conversation_key_falls_back_to_metadata_then_headers() {
        let body = serde_json::json!({"metadata": {"session_id": "meta-sess"}});
        let headers = HashMap::new();
        assert_eq!(resolve_conversation_key(&body, &headers), Some("meta-sess".to_string()));

        let body = serde_json::json!({});
        let mut headers = HashMap::new();
        headers.insert("x-session-id".to_string(), "hdr-sess".to_string());
        assert_eq!(resolve_conversation_key(&body, &headers), Some("hdr-sess".to_string()));
    }

    #[test]
    fn conversation_key_recognizes_camel_case_and_chat_id_variants() {
        let body = serde_json::json!({"metadata": {"chatId": "camel-chat"}});
        let headers = HashMap::new();
        assert_eq!(resolve_conversation_key(&body, &headers), Some("camel-chat".to_string()));

        let body = serde_json::json!({});
        let mut headers = HashMap::new();
        headers.insert("x-thread-id".to_string(), "hdr-thread".to_string());
        assert_eq!(resolve_conversation_key(&body, &headers), Some("hdr-thread".to_string()));

        let mut headers = HashMap::new();
        headers.insert("x-chat-id".to_string(), "hdr-chat".to_string());
        assert_eq!(resolve_conversation_key(&body, &headers), Some("hdr-chat".to_string()));
    }

    #[test]
    fn no_recognized_source_returns_none() {
        let body = serde_json::json!({});
        let headers = HashMap::new();
        assert_eq!(resolve_conversation_key(&body, &headers), None);
    }
}
