//! Credential acquisition and refresh are explicitly out of scope (see the
//! purpose/scope notes); this is only the contract boundary the dialer and
//! pool consult.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Credentials are refreshed with a one-minute safety margin so a token
    /// that is about to expire is never handed to a dialer.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::minutes(1) >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
#[error("credential refresh failed: {0}")]
pub struct CredentialError(pub String);

/// Caches and refreshes credentials for one account. Implementations own
/// the actual refresh flow (JWT cookie exchange, token rotation, …).
#[async_trait]
pub trait CredentialManager: Send + Sync {
    async fn get(&self, account_id: u64) -> Result<Credential, CredentialError>;
}
