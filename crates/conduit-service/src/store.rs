//! File-backed `Store`: accounts and the model registry loaded from the
//! `--providers` JSON file at startup, kept in memory, and persisted back to
//! disk on every mutation via write-then-rename (the same durability
//! pattern the spec uses for credential persistence).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use conduit_core::model::{Account, ModelRegistryEntry, Store, StoreError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One upstream backend a channel dispatches through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSpec {
    pub channel: String,
    pub transport: UpstreamTransport,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamTransport {
    Sse,
    Ws,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    models: Vec<ModelRegistryEntry>,
    #[serde(default)]
    upstreams: Vec<UpstreamSpec>,
}

pub struct FileStore {
    path: PathBuf,
    accounts: RwLock<HashMap<u64, Account>>,
    models: RwLock<HashMap<String, String>>,
    upstreams: Vec<UpstreamSpec>,
}

impl FileStore {
    pub fn load(path: PathBuf) -> std::io::Result<Self> {
        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            ProvidersFile::default()
        };
        let accounts = file.accounts.into_iter().map(|a| (a.id, a)).collect();
        let models = file.models.into_iter().filter(|m| m.enabled).map(|m| (m.model_id, m.channel)).collect();
        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
            models: RwLock::new(models),
            upstreams: file.upstreams,
        })
    }

    pub fn upstreams(&self) -> &[UpstreamSpec] {
        &self.upstreams
    }

    fn persist(&self) {
        let snapshot = ProvidersFile {
            accounts: self.accounts.read().expect("accounts lock poisoned").values().cloned().collect(),
            models: Vec::new(),
            upstreams: self.upstreams.clone(),
        };
        if let Err(err) = write_then_rename(&self.path, &snapshot) {
            warn!(path = %self.path.display(), error = %err, "failed to persist providers file");
        }
    }
}

fn write_then_rename(path: &Path, snapshot: &ProvidersFile) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)
}

#[async_trait]
impl Store for FileStore {
    async fn accounts_for_channel(&self, channel: &str) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .accounts
            .read()
            .expect("accounts lock poisoned")
            .values()
            .filter(|a| a.channel == channel)
            .cloned()
            .collect())
    }

    async fn get_account(&self, id: u64) -> Result<Account, StoreError> {
        self.accounts
            .read()
            .expect("accounts lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(StoreError::AccountNotFound(id))
    }

    async fn update_account(&self, account: &Account) -> Result<(), StoreError> {
        self.accounts.write().expect("accounts lock poisoned").insert(account.id, account.clone());
        self.persist();
        Ok(())
    }

    async fn model_channel(&self, model: &str) -> Result<Option<String>, StoreError> {
        Ok(self.models.read().expect("models lock poisoned").get(model).cloned())
    }
}
