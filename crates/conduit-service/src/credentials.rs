//! Minimal `CredentialManager` binding: reads the bearer token straight out
//! of the account's `credentials` JSON field. Real refresh flows (JWT cookie
//! exchange, token rotation) are an explicit external collaborator per the
//! gateway's scope and are not implemented here.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::model::Store;
use conduit_upstream::credentials::{Credential, CredentialError, CredentialManager};

pub struct AccountCredentialManager {
    store: Arc<dyn Store>,
}

impl AccountCredentialManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialManager for AccountCredentialManager {
    async fn get(&self, account_id: u64) -> Result<Credential, CredentialError> {
        let account = self
            .store
            .get_account(account_id)
            .await
            .map_err(|e| CredentialError(e.to_string()))?;
        let token = account
            .credentials
            .get("token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CredentialError(format!("account {account_id} has no credentials.token")))?;
        Ok(Credential {
            token: token.to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::days(365),
        })
    }
}
