//! Translation between normalized upstream events and the two wire dialects
//! the gateway serves: Anthropic-style `/v1/messages` SSE and OpenAI-style
//! `/v1/chat/completions` SSE, plus the buffered non-streaming JSON shape
//! both dialects also support.

pub mod anthropic_sse;
pub mod json_envelope;
pub mod openai_sse;
pub mod translator;

pub use translator::{StreamTranslator, TranslatedEvent};
