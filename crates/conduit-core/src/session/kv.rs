//! Redis-backed session store: one hash per key, TTL on the hash itself.
//! `Cleanup` is a no-op — Redis's own expiry handles eviction.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::warn;

use super::SessionStore;

const WORKDIR_FIELD: &str = "workdir";
const CONV_ID_FIELD: &str = "conv_id";

pub struct RedisSessionStore {
    conn: ConnectionManager,
    ttl_seconds: i64,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager, ttl: std::time::Duration) -> Self {
        Self {
            conn,
            ttl_seconds: ttl.as_secs() as i64,
        }
    }

    fn key(key: &str) -> String {
        format!("session:{key}")
    }

    async fn refresh_ttl(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.expire(Self::key(key), self.ttl_seconds).await;
        if let Err(err) = result {
            warn!(error = %err, "failed to refresh session ttl");
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get_workdir(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        conn.hget(Self::key(key), WORKDIR_FIELD).await.ok().flatten()
    }

    async fn set_workdir(&self, key: &str, workdir: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.hset(Self::key(key), WORKDIR_FIELD, workdir).await;
        if let Err(err) = result {
            warn!(error = %err, "failed to set session workdir");
            return;
        }
        self.refresh_ttl(key).await;
    }

    async fn get_conv_id(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        conn.hget(Self::key(key), CONV_ID_FIELD).await.ok().flatten()
    }

    async fn set_conv_id(&self, key: &str, conv_id: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.hset(Self::key(key), CONV_ID_FIELD, conv_id).await;
        if let Err(err) = result {
            warn!(error = %err, "failed to set session conversation id");
            return;
        }
        self.refresh_ttl(key).await;
    }

    async fn delete_session(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.del(Self::key(key)).await;
        if let Err(err) = result {
            warn!(error = %err, "failed to delete session");
        }
    }

    async fn touch(&self, key: &str) {
        self.refresh_ttl(key).await;
    }

    async fn cleanup(&self) {
        // Redis's own key TTL handles expiry for this backing.
    }
}
