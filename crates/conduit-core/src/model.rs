//! The account/model data model. Accounts and the model registry are owned
//! by an external `Store`; the gateway only mutates accounts through the
//! load balancer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compact status code mirroring `classify_account_status`'s output, plus the
/// legacy `quota_exceeded` alias kept alongside `"429"` (see Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Ok,
    Code401,
    Code403,
    Code404,
    Code429,
    QuotaExceeded,
}

impl AccountStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "" => Some(AccountStatus::Ok),
            "401" => Some(AccountStatus::Code401),
            "403" => Some(AccountStatus::Code403),
            "404" => Some(AccountStatus::Code404),
            "429" => Some(AccountStatus::Code429),
            "quota_exceeded" => Some(AccountStatus::QuotaExceeded),
            _ => None,
        }
    }

    pub fn as_code(self) -> &'static str {
        match self {
            AccountStatus::Ok => "",
            AccountStatus::Code401 => "401",
            AccountStatus::Code403 => "403",
            AccountStatus::Code404 => "404",
            AccountStatus::Code429 => "429",
            AccountStatus::QuotaExceeded => "quota_exceeded",
        }
    }
}

/// Identity record for one upstream login. Mutated only via the load
/// balancer's status/connection-count helpers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub name: String,
    pub channel: String,
    pub account_type: String,
    pub credentials: serde_json::Value,
    pub status_code: AccountStatus,
    pub last_attempt: Option<DateTime<Utc>>,
    pub quota_reset_at: Option<DateTime<Utc>>,
    /// Lifetime count of successfully dispatched requests.
    #[serde(default)]
    pub request_count: u64,
    /// Lifetime sum of input + output tokens across successful requests.
    #[serde(default)]
    pub total_tokens: u64,
}

impl Account {
    pub fn new(id: u64, name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            channel: channel.into(),
            account_type: String::new(),
            credentials: serde_json::Value::Null,
            status_code: AccountStatus::Ok,
            last_attempt: None,
            quota_reset_at: None,
            request_count: 0,
            total_tokens: 0,
        }
    }

}

/// Read-only logical model id, bound to one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistryEntry {
    pub model_id: String,
    pub channel: String,
    pub enabled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    AccountNotFound(u64),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// External collaborator owning durable storage of accounts and the model
/// registry. The gateway core never persists this data itself.
#[async_trait]
pub trait Store: Send + Sync {
    async fn accounts_for_channel(&self, channel: &str) -> Result<Vec<Account>, StoreError>;
    async fn get_account(&self, id: u64) -> Result<Account, StoreError>;
    async fn update_account(&self, account: &Account) -> Result<(), StoreError>;
    async fn model_channel(&self, model: &str) -> Result<Option<String>, StoreError>;
}
