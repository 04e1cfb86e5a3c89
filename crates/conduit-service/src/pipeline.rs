//! The request pipeline: parse → classify channel → resolve conversation key
//! and workdir → dedup → select account → dispatch/translate → retry on
//! classified error → finalize. One instance of [`Pipeline::run`] per
//! inbound request.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use conduit_core::classifier::{self, ErrorCategory};
use conduit_core::dedup::DedupStore;
use conduit_core::error::GatewayError;
use conduit_core::event::NormalizedEvent;
use conduit_core::fingerprint::{self, resolve_conversation_key};
use conduit_core::request::CanonicalRequest;
use conduit_core::session::SessionStore;
use conduit_translate::translator::TranslatedEvent;
use conduit_translate::StreamTranslator;
use conduit_upstream::credentials::CredentialManager;
use conduit_upstream::pool::WebSocketPool;
use conduit_upstream::sse::SseClient;
use conduit_upstream::ws::{WsClient, WsSocket};
use conduit_upstream::UpstreamClient;
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::config::Config;

/// How a channel reaches its upstream: a shared HTTP client against a base
/// URL, or a shared connection pool against a WebSocket URL. Bound per
/// dispatch to the account the load balancer selected, since credentials and
/// (for SSE) the bearer token are per-account.
pub enum UpstreamBinding {
    Sse {
        http: reqwest::Client,
        base_url: url::Url,
    },
    Ws {
        pool: Arc<WebSocketPool<WsSocket>>,
        url: url::Url,
    },
}

/// Everything a route handler needs to run the pipeline, constructed once at
/// startup and shared via `Arc` (mirrors the teacher's `ServerState`).
pub struct AppState {
    pub config: Config,
    pub balancer: Arc<conduit_core::balancer::LoadBalancer>,
    pub dedup: Arc<dyn DedupStore>,
    pub session: Arc<dyn SessionStore>,
    pub credentials: Arc<dyn CredentialManager>,
    /// One upstream binding per channel; `""` (unknown/model-routed channel)
    /// falls back to whichever channel the model registry resolves to.
    pub upstreams: std::collections::HashMap<String, UpstreamBinding>,
}

impl AppState {
    fn client_for(&self, channel: &str, account_id: u64) -> Result<Arc<dyn UpstreamClient>, GatewayError> {
        let binding = self
            .upstreams
            .get(channel)
            .ok_or_else(|| GatewayError::not_found(format!("no upstream configured for channel '{channel}'")))?;
        Ok(match binding {
            UpstreamBinding::Sse { http, base_url } => {
                Arc::new(SseClient::new(http.clone(), base_url.clone(), Arc::clone(&self.credentials), account_id))
            }
            UpstreamBinding::Ws { pool, url } => {
                Arc::new(WsClient::new(Arc::clone(pool), url.clone(), Arc::clone(&self.credentials), account_id))
            }
        })
    }
}

static WORKDIR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:primary\s+)?working directory:\s*([^\n\r]+)").unwrap());

/// Derives the channel from the URL prefix per §4.10 step 2.
pub fn classify_channel(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/orchids/") {
        let _ = rest;
        return "orchids".to_string();
    }
    if let Some(rest) = path.strip_prefix("/warp/") {
        let _ = rest;
        return "warp".to_string();
    }
    if path.starts_with("/grok/v1/") {
        return "grok".to_string();
    }
    String::new()
}

const WORKDIR_METADATA_KEYS: &[&str] = &[
    "workdir",
    "working_directory",
    "workingDirectory",
    "cwd",
    "workspace",
    "workspace_path",
    "workspacePath",
    "project_root",
    "projectRoot",
];
const WORKDIR_HEADER_NAMES: &[&str] = &[
    "x-workdir",
    "x-working-directory",
    "x-cwd",
    "x-workspace",
    "x-project-root",
];

/// Resolves the working directory from body metadata, headers, or a
/// system-prompt regex, per §6.
pub fn resolve_workdir(body: &Value, headers: &std::collections::HashMap<String, String>, system_text: &str) -> Option<String> {
    if let Some(metadata) = body.get("metadata") {
        for key in WORKDIR_METADATA_KEYS {
            if let Some(v) = metadata.get(key).and_then(Value::as_str) {
                return Some(v.to_string());
            }
        }
    }
    for name in WORKDIR_HEADER_NAMES {
        if let Some(v) = headers.get(*name) {
            return Some(v.clone());
        }
    }
    WORKDIR_REGEX.captures(system_text).map(|c| c[1].trim().to_string())
}

const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-secs";

/// Resolves the per-request deadline: a header override clamped to the
/// configured 2-5 minute range, or the server default.
fn resolve_request_timeout(headers: &std::collections::HashMap<String, String>, default: Duration) -> Duration {
    headers
        .get(REQUEST_TIMEOUT_HEADER)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .map(|d| d.clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT))
        .unwrap_or(default)
}

/// Exponential backoff with a 2-second floor for rate-limit, capped at 30s.
pub fn compute_retry_delay(base: Duration, attempt: u32, category: ErrorCategory) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let floor = if category == ErrorCategory::RateLimit {
        Duration::from_secs(2)
    } else {
        Duration::ZERO
    };
    exp.max(floor).min(Duration::from_secs(30))
}

pub struct IncomingRequest {
    pub path: String,
    pub headers: std::collections::HashMap<String, String>,
    pub authorization: Option<String>,
    pub body_bytes: Vec<u8>,
    pub body: Value,
}

/// Outcome of running the pipeline: either a translated event stream to
/// render, or a short-circuited error.
pub enum PipelineOutcome {
    Stream {
        receiver: tokio::sync::mpsc::UnboundedReceiver<TranslatedEvent>,
        message_id: String,
        model: String,
        stream: bool,
    },
}

/// Detects requests that are answered locally without dispatching upstream:
/// command-prefix policy checks and topic-classifier probes. Both are
/// recognized by a conventional sentinel the caller embeds in the system
/// prompt; genuine conversational traffic never matches.
fn fast_path_response(request: &CanonicalRequest) -> Option<Value> {
    let system_text: String = request.system.iter().map(|s| s.text.as_str()).collect();
    if system_text.contains("__conduit_command_prefix_policy__") {
        return Some(serde_json::json!({"allowed": true}));
    }
    if system_text.contains("__conduit_topic_classifier__") {
        return Some(serde_json::json!({"topic": "general"}));
    }
    None
}

pub async fn run(state: &AppState, incoming: IncomingRequest) -> Result<PipelineOutcome, GatewayError> {
    // Step 1: parse and validate.
    let request: CanonicalRequest = serde_json::from_value(incoming.body.clone())
        .map_err(|e| GatewayError::invalid_request(format!("malformed request body: {e}")))?;
    if request.model.is_empty() || request.messages.is_empty() {
        return Err(GatewayError::invalid_request("model and messages are required"));
    }
    if !request.is_eligible_for_dispatch() {
        return Err(GatewayError::invalid_request("the last message must be from the user"));
    }

    // Step 2: classify channel.
    let mut channel = classify_channel(&incoming.path);
    if channel.is_empty() {
        channel = state
            .balancer
            .model_channel(&request.model)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
    }

    // Step 3: resolve conversation key and workdir.
    let conversation_key = resolve_conversation_key(&incoming.body, &incoming.headers);
    let system_text: String = request.system.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n");
    let mut resolved_workdir = resolve_workdir(&incoming.body, &incoming.headers, &system_text);
    let mut workdir_changed = false;
    if let (Some(key), Some(workdir)) = (&conversation_key, &resolved_workdir) {
        let previous = state.session.get_workdir(key).await;
        workdir_changed = previous.as_deref() != Some(workdir.as_str());
        state.session.set_workdir(key, workdir).await;
    } else if let Some(key) = &conversation_key {
        // No workdir in this turn's body/headers/system prompt: fall back to
        // the last one persisted under this session key.
        resolved_workdir = state.session.get_workdir(key).await;
    }

    debug!(channel = %channel, conversation_key = ?conversation_key, workdir = ?resolved_workdir, workdir_changed, "pipeline: resolved routing");

    // Step 4: dedup check.
    let fp = fingerprint::fingerprint(&incoming.path, incoming.authorization.as_deref(), &incoming.body_bytes);
    let (is_duplicate, has_in_flight) = state.dedup.register(&fp).await;
    if is_duplicate && has_in_flight {
        return Err(GatewayError::new(
            conduit_core::error::SurfaceCode::RateLimitExceeded,
            "duplicate in-flight request",
        ));
    }
    if is_duplicate {
        warn!(fingerprint = %fp, "duplicate request observed without an in-flight original; allowing through");
    }
    let finish_dedup = {
        let dedup = Arc::clone(&state.dedup);
        let fp = fp.clone();
        move || {
            tokio::spawn(async move { dedup.finish(&fp).await });
        }
    };

    // Step 5: fast paths.
    if let Some(body) = fast_path_response(&request) {
        finish_dedup();
        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut translator = StreamTranslator::new(state.config.keepalive_interval);
        for event in [
            NormalizedEvent::TextStart,
            NormalizedEvent::TextDelta { text: body.to_string() },
            NormalizedEvent::TextEnd,
            NormalizedEvent::Finish { reason: conduit_core::event::FinishReason::Stop },
        ] {
            for translated in translator.handle(event, Instant::now()) {
                let _ = tx.send(translated);
            }
        }
        return Ok(PipelineOutcome::Stream {
            receiver: rx,
            message_id,
            model: request.model.clone(),
            stream: request.stream,
        });
    }

    let mut exclude: HashSet<u64> = HashSet::new();
    let mut attempt: u32 = 0;
    let request_timeout = resolve_request_timeout(&incoming.headers, state.config.request_timeout);
    let deadline = tokio::time::Instant::now() + request_timeout;

    loop {
        // Step 6: select account.
        let account = match state.balancer.select_account(&channel, &exclude).await {
            Ok(account) => account,
            Err(_) => {
                finish_dedup();
                return Err(GatewayError::overloaded("no eligible account available"));
            }
        };
        let _connection_guard = state.balancer.acquire(account.id);

        // Step 7: build canonical request (alias table / history rewrite are
        // prompt-construction concerns, out of scope per spec §1; the
        // canonical request is dispatched as resolved in step 1).
        let mut dispatch_request = request.clone();
        dispatch_request.conversation_id = conversation_key.clone();
        if workdir_changed {
            debug!(account = account.id, "workdir changed since last turn; history rewrite deferred to the prompt-construction collaborator");
        }

        // Step 8: dispatch and translate.
        let client = match state.client_for(&channel, account.id) {
            Ok(c) => c,
            Err(e) => {
                finish_dedup();
                return Err(e);
            }
        };

        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let keepalive_interval = state.config.keepalive_interval;
        let dispatch_result =
            match tokio::time::timeout_at(deadline, dispatch(client, dispatch_request, keepalive_interval, tx)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    // The per-request deadline covers every retry; once it's gone,
                    // the attempt is canceled outright rather than retried (§5).
                    finish_dedup();
                    return Err(GatewayError::new(
                        conduit_core::error::SurfaceCode::Timeout,
                        "request exceeded its configured timeout",
                    ));
                }
            };

        match dispatch_result {
            Ok((input_tokens, output_tokens)) => {
                finish_dedup();
                info!(account = account.id, channel = %channel, attempt, "request dispatched successfully");
                if let (Some(key), Some(conv_id)) = (&conversation_key, extract_conversation_id_hint(&incoming.body)) {
                    state.session.set_conv_id(key, &conv_id).await;
                }
                let balancer = Arc::clone(&state.balancer);
                let account_id = account.id;
                let input_tokens = input_tokens.unwrap_or_default();
                let output_tokens = output_tokens.unwrap_or_default();
                tokio::spawn(async move {
                    if let Err(e) = balancer.record_usage(account_id, input_tokens, output_tokens).await {
                        warn!(account = account_id, error = %e, "failed to record account usage stats");
                    }
                });
                return Ok(PipelineOutcome::Stream {
                    receiver: rx,
                    message_id,
                    model: request.model.clone(),
                    stream: request.stream,
                });
            }
            Err(err) => {
                let classification = classifier::classify(&err.message);
                let retries_remaining = attempt < state.config.retry_budget;
                if classification.retryable && classification.switch_account && retries_remaining {
                    let status_code = classifier::classify_account_status(&err.message);
                    let _ = state.balancer.mark_status(account.id, status_code).await;
                    let delay = compute_retry_delay(Duration::from_millis(250), attempt, classification.category);
                    tokio::time::sleep(delay).await;
                    exclude.insert(account.id);
                    attempt += 1;
                    continue;
                }
                finish_dedup();
                return Err(err);
            }
        }
    }
}

/// Best-effort hint of an upstream-assigned conversation id from the
/// inbound body; the authoritative value comes from a `conversation_id`
/// normalized event emitted during dispatch and is wired in by the caller
/// once translation has produced it.
fn extract_conversation_id_hint(body: &Value) -> Option<String> {
    body.get("conversation_id").and_then(Value::as_str).map(str::to_string)
}

async fn dispatch(
    client: Arc<dyn UpstreamClient>,
    request: CanonicalRequest,
    keepalive_interval: Duration,
    tx: UnboundedSender<TranslatedEvent>,
) -> Result<(Option<u32>, Option<u32>), GatewayError> {
    // `OnEvent` requires `Fn + Send + Sync`, but translating mutates the
    // translator's block bookkeeping, so the shared state needs a `Mutex`
    // rather than a bare `&mut` capture. Kept in an `Arc` so the token counts
    // it accumulated are still readable once dispatch finishes.
    let translator = Arc::new(std::sync::Mutex::new(StreamTranslator::new(keepalive_interval)));
    let on_event = {
        let translator = Arc::clone(&translator);
        move |event: NormalizedEvent| {
            let mut translator = translator.lock().expect("translator mutex poisoned");
            for translated in translator.handle(event, Instant::now()) {
                let _ = tx.send(translated);
            }
        }
    };
    client.send_request_with_payload(&request, &on_event).await?;
    Ok(translator.lock().expect("translator mutex poisoned").tokens())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_channel_reads_url_prefix() {
        assert_eq!(classify_channel("/orchids/v1/messages"), "orchids");
        assert_eq!(classify_channel("/warp/v1/messages"), "warp");
        assert_eq!(classify_channel("/grok/v1/messages"), "grok");
        assert_eq!(classify_channel("/v1/messages"), "");
    }

    #[test]
    fn resolve_workdir_prefers_metadata_then_headers_then_regex() {
        let body = serde_json::json!({"metadata": {"cwd": "/from/metadata"}});
        let headers = std::collections::HashMap::new();
        assert_eq!(resolve_workdir(&body, &headers, ""), Some("/from/metadata".to_string()));

        let body = serde_json::json!({});
        let mut headers = std::collections::HashMap::new();
        headers.insert("x-workdir".to_string(), "/from/header".to_string());
        assert_eq!(resolve_workdir(&body, &headers, ""), Some("/from/header".to_string()));

        let body = serde_json::json!({});
        let headers = std::collections::HashMap::new();
        assert_eq!(
            resolve_workdir(&body, &headers, "Primary working directory: /from/system\nmore text"),
            Some("/from/system".to_string())
        );
    }

    #[test]
    fn compute_retry_delay_floors_rate_limit_at_two_seconds() {
        let delay = compute_retry_delay(Duration::from_millis(100), 0, ErrorCategory::RateLimit);
        assert!(delay >= Duration::from_secs(2));
    }

    #[test]
    fn compute_retry_delay_caps_at_thirty_seconds() {
        let delay = compute_retry_delay(Duration::from_secs(1), 10, ErrorCategory::Server);
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn resolve_request_timeout_clamps_header_override_into_range() {
        let default = Duration::from_secs(180);

        let headers = std::collections::HashMap::new();
        assert_eq!(resolve_request_timeout(&headers, default), default);

        let mut headers = std::collections::HashMap::new();
        headers.insert("x-request-timeout-secs".to_string(), "10".to_string());
        assert_eq!(resolve_request_timeout(&headers, default), MIN_REQUEST_TIMEOUT);

        headers.insert("x-request-timeout-secs".to_string(), "9000".to_string());
        assert_eq!(resolve_request_timeout(&headers, default), MAX_REQUEST_TIMEOUT);

        headers.insert("x-request-timeout-secs".to_string(), "200".to_string());
        assert_eq!(resolve_request_timeout(&headers, default), Duration::from_secs(200));
    }
}
