//! Account selection and lifecycle: channel-scoped selection among eligible
//! accounts, connection counting, and status/cooldown management driven by
//! classifier output.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use thiserror::Error;

use crate::model::{Account, AccountStatus, Store, StoreError};

#[derive(Debug, Error)]
pub enum NoEligibleAccount {
    #[error("no eligible account for channel {0}")]
    ForChannel(String),
}

/// RAII connection-slot release: `LoadBalancer::acquire` returns one of
/// these, and dropping it (on every exit path, including early returns)
/// releases the slot.
pub struct ConnectionGuard {
    counter: Arc<AtomicI64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct LoadBalancer {
    store: Arc<dyn Store>,
    connections: RwLock<HashMap<u64, Arc<AtomicI64>>>,
    rate_limit_cooldown: ChronoDuration,
}

impl LoadBalancer {
    pub fn new(store: Arc<dyn Store>, rate_limit_cooldown: std::time::Duration) -> Self {
        Self {
            store,
            connections: RwLock::new(HashMap::new()),
            rate_limit_cooldown: ChronoDuration::from_std(rate_limit_cooldown)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
        }
    }

    fn counter_for(&self, id: u64) -> Arc<AtomicI64> {
        if let Some(counter) = self.connections.read().expect("connections lock poisoned").get(&id) {
            return Arc::clone(counter);
        }
        let mut guard = self.connections.write().expect("connections lock poisoned");
        Arc::clone(guard.entry(id).or_insert_with(|| Arc::new(AtomicI64::new(0))))
    }

    pub fn connection_count(&self, id: u64) -> i64 {
        self.counter_for(id).load(Ordering::SeqCst)
    }

    /// Acquires a connection slot for `id`; release happens automatically
    /// when the returned guard is dropped.
    pub fn acquire(&self, id: u64) -> ConnectionGuard {
        let counter = self.counter_for(id);
        counter.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard { counter }
    }

    fn is_eligible(&self, account: &Account, now: DateTime<Utc>) -> bool {
        match account.status_code {
            AccountStatus::Ok => true,
            AccountStatus::Code401 | AccountStatus::Code403 | AccountStatus::Code404 => false,
            AccountStatus::Code429 => account
                .last_attempt
                .is_none_or(|last| now >= last + self.rate_limit_cooldown),
            AccountStatus::QuotaExceeded => account.quota_reset_at.is_none_or(|reset| now >= reset),
        }
    }

    /// Returns the next eligible account for `channel`, excluding any id in
    /// `exclude`. Selection is least-connections among the eligible set.
    pub async fn select_account(&self, channel: &str, exclude: &HashSet<u64>) -> Result<Account, NoEligibleAccount> {
        let accounts = self
            .store
            .accounts_for_channel(channel)
            .await
            .map_err(|_| NoEligibleAccount::ForChannel(channel.to_string()))?;
        let now = Utc::now();
        let mut eligible: Vec<Account> = accounts
            .into_iter()
            .filter(|a| !exclude.contains(&a.id) && self.is_eligible(a, now))
            .collect();
        if eligible.is_empty() {
            return Err(NoEligibleAccount::ForChannel(channel.to_string()));
        }
        eligible.sort_by_key(|a| self.connection_count(a.id));
        Ok(eligible.remove(0))
    }

    pub async fn model_channel(&self, model: &str) -> Result<Option<String>, StoreError> {
        self.store.model_channel(model).await
    }

    /// Updates `status_code`/`last_attempt`/`quota_reset_at` per the
    /// classifier's compact status code. A no-op if the status is unchanged,
    /// so an account already cooling down doesn't have its cooldown reset by
    /// a second identical failure.
    pub async fn mark_status(&self, account_id: u64, status_code: &str) -> Result<(), StoreError> {
        if status_code.is_empty() {
            return Ok(());
        }
        let Some(new_status) = AccountStatus::from_code(status_code) else {
            return Ok(());
        };
        let mut account = self.store.get_account(account_id).await?;
        if account.status_code == new_status {
            return Ok(());
        }
        let now = Utc::now();
        account.status_code = new_status;
        account.last_attempt = Some(now);
        account.quota_reset_at = if new_status == AccountStatus::QuotaExceeded {
            Some(first_of_next_month_utc(now))
        } else {
            None
        };
        self.store.update_account(&account).await
    }

    /// Folds a successful dispatch's token usage into the account's running
    /// stats. Called fire-and-forget after the response stream completes, so
    /// it never delays the response to the caller.
    pub async fn record_usage(&self, account_id: u64, input_tokens: u32, output_tokens: u32) -> Result<(), StoreError> {
        let mut account = self.store.get_account(account_id).await?;
        account.request_count += 1;
        account.total_tokens += u64::from(input_tokens) + u64::from(output_tokens);
        self.store.update_account(&account).await
    }
}

/// First instant of the next calendar month, UTC. The account's configured
/// time zone from the spec is not modeled here since no per-account zone
/// field exists in the data model; see the grounding ledger for this call.
fn first_of_next_month_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStore {
        accounts: Mutex<HashMap<u64, Account>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn accounts_for_channel(&self, channel: &str) -> Result<Vec<Account>, StoreError> {
            Ok(self
                .accounts
                .lock()
                .unwrap()
                .values()
                .filter(|a| a.channel == channel)
                .cloned()
                .collect())
        }

        async fn get_account(&self, id: u64) -> Result<Account, StoreError> {
            self.accounts
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(StoreError::AccountNotFound(id))
        }

        async fn update_account(&self, account: &Account) -> Result<(), StoreError> {
            self.accounts.lock().unwrap().insert(account.id, account.clone());
            Ok(())
        }

        async fn model_channel(&self, _model: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
    }

    fn store_with(accounts: Vec<Account>) -> Arc<FakeStore> {
        Arc::new(FakeStore {
            accounts: Mutex::new(accounts.into_iter().map(|a| (a.id, a)).collect()),
        })
    }

    #[tokio::test]
    async fn selects_least_loaded_eligible_account() {
        let store = store_with(vec![
            Account::new(1, "a", "orchids"),
            Account::new(2, "b", "orchids"),
        ]);
        let lb = LoadBalancer::new(store, std::time::Duration::from_secs(30));
        let _guard = lb.acquire(1);
        let chosen = lb.select_account("orchids", &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[tokio::test]
    async fn excluded_accounts_are_skipped() {
        let store = store_with(vec![Account::new(1, "a", "orchids")]);
        let lb = LoadBalancer::new(store, std::time::Duration::from_secs(30));
        let mut exclude = HashSet::new();
        exclude.insert(1);
        let result = lb.select_account("orchids", &exclude).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn no_accounts_for_channel_is_no_eligible_account() {
        let store = store_with(vec![]);
        let lb = LoadBalancer::new(store, std::time::Duration::from_secs(30));
        let result = lb.select_account("grok", &HashSet::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn repeated_identical_status_does_not_reset_cooldown() {
        let store = store_with(vec![Account::new(1, "a", "orchids")]);
        let lb = LoadBalancer::new(Arc::clone(&store), std::time::Duration::from_secs(30));
        lb.mark_status(1, "429").await.unwrap();
        let first_attempt = store.get_account(1).await.unwrap().last_attempt;
        lb.mark_status(1, "429").await.unwrap();
        let second_attempt = store.get_account(1).await.unwrap().last_attempt;
        assert_eq!(first_attempt, second_attempt);
    }

    #[tokio::test]
    async fn account_becomes_ineligible_on_401() {
        let store = store_with(vec![Account::new(1, "a", "orchids")]);
        let lb = LoadBalancer::new(Arc::clone(&store), std::time::Duration::from_secs(30));
        lb.mark_status(1, "401").await.unwrap();
        let result = lb.select_account("orchids", &HashSet::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn record_usage_accumulates_request_count_and_tokens() {
        let store = store_with(vec![Account::new(1, "a", "orchids")]);
        let lb = LoadBalancer::new(Arc::clone(&store), std::time::Duration::from_secs(30));
        lb.record_usage(1, 100, 50).await.unwrap();
        lb.record_usage(1, 10, 5).await.unwrap();
        let account = store.get_account(1).await.unwrap();
        assert_eq!(account.request_count, 2);
        assert_eq!(account.total_tokens, 165);
    }

    #[tokio::test]
    async fn connection_guard_releases_slot_on_drop() {
        let store = store_with(vec![Account::new(1, "a", "orchids")]);
        let lb = LoadBalancer::new(store, std::time::Duration::from_secs(30));
        {
            let _guard = lb.acquire(1);
            assert_eq!(lb.connection_count(1), 1);
        }
        assert_eq!(lb.connection_count(1), 0);
    }
}
