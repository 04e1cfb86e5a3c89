//! The closed taxonomy of surface errors the gateway returns to clients, plus
//! the mapping to HTTP status codes. Underlying causes are kept for logging
//! only and are never serialized to the client.

use std::fmt;

/// Surface error code returned to clients in both wire dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceCode {
    InvalidRequest,
    Authentication,
    PermissionDenied,
    NotFound,
    RateLimitExceeded,
    Overloaded,
    UpstreamError,
    Timeout,
    CircuitBreakerOpen,
    Internal,
}

impl SurfaceCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SurfaceCode::InvalidRequest => "invalid_request_error",
            SurfaceCode::Authentication => "authentication_error",
            SurfaceCode::PermissionDenied => "permission_denied",
            SurfaceCode::NotFound => "not_found",
            SurfaceCode::RateLimitExceeded => "rate_limit_exceeded",
            SurfaceCode::Overloaded => "overloaded_error",
            SurfaceCode::UpstreamError => "upstream_error",
            SurfaceCode::Timeout => "timeout_error",
            SurfaceCode::CircuitBreakerOpen => "circuit_breaker_open",
            SurfaceCode::Internal => "internal_error",
        }
    }

    /// The HTTP status this surface code is served with by default. Some
    /// codes (`invalid_request_error`, `overloaded_error`) have more than one
    /// underlying HTTP status in the spec; callers producing a specific one
    /// should set the status directly rather than relying on this default.
    pub fn default_http_status(self) -> u16 {
        match self {
            SurfaceCode::InvalidRequest => 400,
            SurfaceCode::Authentication => 401,
            SurfaceCode::PermissionDenied => 403,
            SurfaceCode::NotFound => 404,
            SurfaceCode::RateLimitExceeded => 429,
            SurfaceCode::Overloaded => 503,
            SurfaceCode::UpstreamError => 502,
            SurfaceCode::Timeout => 504,
            SurfaceCode::CircuitBreakerOpen => 503,
            SurfaceCode::Internal => 500,
        }
    }
}

impl fmt::Display for SurfaceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed gateway error. `cause` carries detail for logging; `message` is
/// the opaque, client-facing text.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: SurfaceCode,
    pub message: String,
    pub http_status: u16,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GatewayError {
    pub fn new(code: SurfaceCode, message: impl Into<String>) -> Self {
        let http_status = code.default_http_status();
        Self {
            code,
            message: message.into(),
            http_status,
            cause: None,
        }
    }

    pub fn with_status(mut self, http_status: u16) -> Self {
        self.http_status = http_status;
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(SurfaceCode::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(SurfaceCode::NotFound, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(SurfaceCode::Overloaded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(SurfaceCode::Internal, message)
    }

    /// Renders the client-visible error envelope shared by both wire
    /// dialects: `{"type":"error","error":{"type":<code>,"message":<human>}}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.code.as_str(),
                "message": self.message,
            }
        })
    }
}
