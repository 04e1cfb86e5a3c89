//! Maps free-form upstream error strings to a closed taxonomy that drives the
//! pipeline's retry and account-switch policy.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Canceled,
    Auth,
    AuthBlocked403,
    AuthBlocked404,
    Client,
    RateLimit,
    Timeout,
    Network,
    Server,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Canceled => "canceled",
            ErrorCategory::Auth => "auth",
            ErrorCategory::AuthBlocked403 => "auth_blocked_403",
            ErrorCategory::AuthBlocked404 => "auth_blocked_404",
            ErrorCategory::Client => "client",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::Server => "server",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub switch_account: bool,
}

impl Classification {
    const fn new(category: ErrorCategory, retryable: bool, switch_account: bool) -> Self {
        Self {
            category,
            retryable,
            switch_account,
        }
    }
}

/// Recognizes an HTTP status code only inside one of a fixed set of
/// contextual patterns, so a model name that happens to contain digits is
/// never misread as a status line.
fn http_code_regex(code: u16) -> Regex {
    Regex::new(&format!(
        r"(?i)(?:\bhttp[/ ]?1\.1\s+{code}\b|\bhttp\s+{code}\b|\bstatus\s*:?\s*{code}\b|\bcode\s*:?\s*{code}\b)"
    ))
    .expect("static pattern is valid regex")
}

static HTTP_401: LazyLock<Regex> = LazyLock::new(|| http_code_regex(401));
static HTTP_403: LazyLock<Regex> = LazyLock::new(|| http_code_regex(403));
static HTTP_404: LazyLock<Regex> = LazyLock::new(|| http_code_regex(404));
static HTTP_429: LazyLock<Regex> = LazyLock::new(|| http_code_regex(429));
static HTTP_400: LazyLock<Regex> = LazyLock::new(|| http_code_regex(400));
static HTTP_5XX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bhttp[/ ]?1\.1\s+5\d{2}\b|\bhttp\s+5\d{2}\b|\bstatus\s*:?\s*5\d{2}\b|\bcode\s*:?\s*5\d{2}\b)")
        .expect("static pattern is valid regex")
});

// Word-boundary matches on the category's own slug, so classify() is
// idempotent on its own canonical category strings: "_" is a word
// character, so `\bauth\b` does not match inside "auth_blocked_403".
fn word_regex(word: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{word}\b")).expect("static pattern is valid regex")
}

static WORD_AUTH: LazyLock<Regex> = LazyLock::new(|| word_regex("auth"));
static WORD_AUTH_BLOCKED_403: LazyLock<Regex> = LazyLock::new(|| word_regex("auth_blocked_403"));
static WORD_AUTH_BLOCKED_404: LazyLock<Regex> = LazyLock::new(|| word_regex("auth_blocked_404"));
static WORD_CLIENT: LazyLock<Regex> = LazyLock::new(|| word_regex("client"));
static WORD_RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| word_regex("rate_limit"));
static WORD_TIMEOUT: LazyLock<Regex> = LazyLock::new(|| word_regex("timeout"));
static WORD_NETWORK: LazyLock<Regex> = LazyLock::new(|| word_regex("network"));
static WORD_SERVER: LazyLock<Regex> = LazyLock::new(|| word_regex("server"));

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Pure function from a free-form upstream error string to a tagged
/// classification driving retry and account-switch behavior.
pub fn classify(err: &str) -> Classification {
    let lower = err.to_lowercase();

    if contains_any(&lower, &["context canceled", "canceled", "cancelled"]) {
        return Classification::new(ErrorCategory::Canceled, false, false);
    }

    if HTTP_401.is_match(&lower) || contains_any(&lower, &["signed out"]) || WORD_AUTH.is_match(&lower) {
        return Classification::new(ErrorCategory::Auth, true, true);
    }

    if HTTP_403.is_match(&lower) || WORD_AUTH_BLOCKED_403.is_match(&lower) {
        return Classification::new(ErrorCategory::AuthBlocked403, true, true);
    }

    if HTTP_404.is_match(&lower) || WORD_AUTH_BLOCKED_404.is_match(&lower) {
        return Classification::new(ErrorCategory::AuthBlocked404, false, false);
    }

    if HTTP_429.is_match(&lower)
        || contains_any(
            &lower,
            &[
                "too many requests",
                "rate limit",
                "out of credits",
                "no remaining quota",
                "quota exceeded",
                "insufficient credits",
            ],
        )
        || WORD_RATE_LIMIT.is_match(&lower)
    {
        return Classification::new(ErrorCategory::RateLimit, true, true);
    }

    if HTTP_400.is_match(&lower) || contains_any(&lower, &["input is too long"]) || WORD_CLIENT.is_match(&lower) {
        return Classification::new(ErrorCategory::Client, false, false);
    }

    if contains_any(&lower, &["timeout", "deadline exceeded"]) || WORD_TIMEOUT.is_match(&lower) {
        return Classification::new(ErrorCategory::Timeout, true, true);
    }

    if contains_any(
        &lower,
        &[
            "connection reset",
            "connection refused",
            "unexpected eof",
            "broken pipe",
        ],
    ) || lower.trim_end().ends_with(": eof")
        || WORD_NETWORK.is_match(&lower)
    {
        return Classification::new(ErrorCategory::Network, true, true);
    }

    if HTTP_5XX.is_match(&lower) || WORD_SERVER.is_match(&lower) {
        return Classification::new(ErrorCategory::Server, true, true);
    }

    Classification::new(ErrorCategory::Unknown, true, true)
}

/// Phrases `classify()` treats as rate-limit but that name an exhausted
/// quota specifically, rather than a transient 429 — these map to
/// `quota_exceeded` (first-of-next-month reset) instead of `429` (cooldown
/// reset); see DESIGN.md's account-status Open Question.
const QUOTA_EXCEEDED_PHRASES: &[&str] = &["out of credits", "no remaining quota", "quota exceeded", "insufficient credits"];

/// A compact status code used to update `Account::status_code`. Deliberately
/// narrower than `classify`: "model not found" style provider errors are
/// request-level, not account-level, and must not flip the account status.
pub fn classify_account_status(err: &str) -> &'static str {
    let lower = err.to_lowercase();
    if lower.contains("model not found") || lower.contains("model is not found") {
        return "";
    }
    if HTTP_401.is_match(&lower) {
        "401"
    } else if HTTP_403.is_match(&lower) {
        "403"
    } else if HTTP_404.is_match(&lower) {
        "404"
    } else if contains_any(&lower, QUOTA_EXCEEDED_PHRASES) {
        "quota_exceeded"
    } else if HTTP_429.is_match(&lower) || contains_any(&lower, &["too many requests", "rate limit"]) || WORD_RATE_LIMIT.is_match(&lower) {
        "429"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_from_quota_phrase() {
        let c = classify("orchids upstream error: no remaining quota: You have run out of credits.");
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert!(c.retryable);
        assert!(c.switch_account);
    }

    #[test]
    fn quota_phrase_updates_account_status_without_an_http_code() {
        assert_eq!(
            classify_account_status("orchids upstream error: no remaining quota: You have run out of credits."),
            "quota_exceeded"
        );
        assert_eq!(classify_account_status("429 too many requests"), "429");
    }

    #[test]
    fn model_not_found_has_no_account_status() {
        assert_eq!(classify_account_status("model is not found"), "");
        assert_eq!(classify_account_status("the model not found for this account"), "");
    }

    #[test]
    fn bare_digits_do_not_trigger_http_classification() {
        // A model name containing digits must not be read as an HTTP status.
        let c = classify("gpt-401-turbo did something weird");
        assert_eq!(c.category, ErrorCategory::Unknown);
    }

    #[test]
    fn contextual_http_status_is_recognized() {
        assert_eq!(classify("request failed: HTTP 401 Unauthorized").category, ErrorCategory::Auth);
        assert_eq!(classify("status: 403 forbidden").category, ErrorCategory::AuthBlocked403);
        assert_eq!(classify("code:404 not found").category, ErrorCategory::AuthBlocked404);
        assert_eq!(classify("HTTP/1.1 429 Too Many Requests").category, ErrorCategory::RateLimit);
        assert_eq!(classify("http 503 service unavailable").category, ErrorCategory::Server);
    }

    #[test]
    fn canceled_never_retries() {
        let c = classify("context canceled");
        assert_eq!(c.category, ErrorCategory::Canceled);
        assert!(!c.retryable);
        assert!(!c.switch_account);
    }

    #[test]
    fn network_errors_detected() {
        assert_eq!(classify("read tcp: connection reset by peer").category, ErrorCategory::Network);
        assert_eq!(classify("write: broken pipe").category, ErrorCategory::Network);
        assert_eq!(classify("unexpected EOF").category, ErrorCategory::Network);
        assert_eq!(classify("io error: EOF").category, ErrorCategory::Network);
    }

    #[test]
    fn idempotence_on_canonical_category_strings() {
        for s in ["canceled", "auth", "rate_limit", "timeout", "network", "server", "unknown"] {
            let first = classify(s).category;
            let second = classify(first.as_str()).category;
            assert_eq!(first, second, "category {s} not idempotent");
        }
    }
}
