//! Session tracking: working directory and upstream conversation id per
//! conversation key.

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod kv;

pub use memory::MemorySessionStore;
#[cfg(feature = "redis-backend")]
pub use kv::RedisSessionStore;

/// Contract shared by both backings. `Set*` implicitly touches (refreshes
/// TTL); `Touch` refreshes TTL without mutating values.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_workdir(&self, key: &str) -> Option<String>;
    async fn set_workdir(&self, key: &str, workdir: &str);
    async fn get_conv_id(&self, key: &str) -> Option<String>;
    async fn set_conv_id(&self, key: &str, conv_id: &str);
    async fn delete_session(&self, key: &str);
    async fn touch(&self, key: &str);
    /// Evicts expired entries. A no-op for backings where TTL is enforced by
    /// the store itself.
    async fn cleanup(&self);
}
