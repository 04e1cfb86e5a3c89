//! Redis-backed dedup store. `Register`/`Finish` are each a single Lua
//! script so the read-decide-write cycle is race-free across processes.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use tracing::warn;

use super::DedupStore;

/// Backstop TTL on the Redis key itself; logical expiry is computed from
/// `last` inside the scripts using `window_ms`.
const KEY_TTL_SECONDS: i64 = 60;

// KEYS[1] = fingerprint key, ARGV[1] = now_ms, ARGV[2] = window_ms, ARGV[3] = ttl_seconds.
// Returns {is_duplicate, has_in_flight} as 0/1 integers.
const REGISTER_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local last, inflight
if raw then
    local sep = string.find(raw, ':')
    last = tonumber(string.sub(raw, 1, sep - 1))
    inflight = tonumber(string.sub(raw, sep + 1))
else
    last = nil
    inflight = 0
end
local is_dup = 0
local has_inflight = 0
if last ~= nil and (now - last) <= window then
    is_dup = 1
    if inflight > 0 then has_inflight = 1 end
    inflight = inflight + 1
else
    inflight = 1
end
redis.call('SET', KEYS[1], tostring(now) .. ':' .. tostring(inflight), 'EX', tonumber(ARGV[3]))
return {is_dup, has_inflight}
"#;

// KEYS[1] = fingerprint key, ARGV[1] = now_ms, ARGV[2] = ttl_seconds.
const FINISH_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local inflight = 0
if raw then
    local sep = string.find(raw, ':')
    inflight = tonumber(string.sub(raw, sep + 1))
end
inflight = inflight - 1
if inflight < 0 then inflight = 0 end
redis.call('SET', KEYS[1], tostring(ARGV[1]) .. ':' .. tostring(inflight), 'EX', tonumber(ARGV[2]))
return inflight
"#;

pub struct RedisDedupStore {
    conn: ConnectionManager,
    window_ms: i64,
    register_script: Script,
    finish_script: Script,
}

impl RedisDedupStore {
    pub fn new(conn: ConnectionManager, window: std::time::Duration) -> Self {
        Self {
            conn,
            window_ms: window.as_millis() as i64,
            register_script: Script::new(REGISTER_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
        }
    }

    fn key(fingerprint: &str) -> String {
        format!("dedup:{fingerprint}")
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn register(&self, fingerprint: &str) -> (bool, bool) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Value> = self
            .register_script
            .key(Self::key(fingerprint))
            .arg(now_ms())
            .arg(self.window_ms)
            .arg(KEY_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(Value::Array(items)) if items.len() == 2 => {
                let is_dup = matches!(items[0], Value::Int(1));
                let has_inflight = matches!(items[1], Value::Int(1));
                (is_dup, has_inflight)
            }
            Ok(_) => {
                warn!("dedup register script returned an unexpected shape");
                (false, false)
            }
            Err(err) => {
                warn!(error = %err, "dedup register script failed; treating as non-duplicate");
                (false, false)
            }
        }
    }

    async fn finish(&self, fingerprint: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = self
            .finish_script
            .key(Self::key(fingerprint))
            .arg(now_ms())
            .arg(KEY_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(error = %err, "dedup finish script failed");
        }
    }
}
