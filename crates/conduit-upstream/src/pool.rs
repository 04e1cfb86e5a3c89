//! Fixed-capacity WebSocket connection pool with keep-alive pinging.
//!
//! Generic over the pooled socket type so the pool itself doesn't depend on
//! `tokio-tungstenite` directly; [`crate::ws`] is the concrete user.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;

/// What a pooled socket must support: a liveness probe for keep-alive, and a
/// read-deadline check so dead peers are detected before borrow.
#[async_trait]
pub trait Socket: Send {
    async fn ping(&mut self) -> bool;
    fn read_deadline_expired(&self, now: Instant) -> bool;
}

pub struct PoolEntry<S> {
    pub socket: S,
    pub last_used: Instant,
}

/// What `get` hands back: a pooled borrow that must be returned via `put`,
/// or a one-shot direct connection the caller closes itself and never
/// returns to the pool.
pub enum Acquired<S> {
    Pooled(PoolEntry<S>),
    Direct(S),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationPolicy {
    Block,
    FailoverDirect,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("dial failed: {0}")]
    Dial(String),
}

/// Borrowed sockets are never present in `idle`; returned sockets are either
/// put back (if healthy and under cap) or dropped (closed).
pub struct WebSocketPool<S> {
    capacity: usize,
    idle: Mutex<VecDeque<PoolEntry<S>>>,
    borrowed: AtomicUsize,
    policy: SaturationPolicy,
    freed: Notify,
}

impl<S: Socket + 'static> WebSocketPool<S> {
    pub fn new(capacity: usize, policy: SaturationPolicy) -> Self {
        Self {
            capacity,
            idle: Mutex::new(VecDeque::new()),
            borrowed: AtomicUsize::new(0),
            policy,
            freed: Notify::new(),
        }
    }

    /// Returns an idle socket if one is available; otherwise dials a new one
    /// via `dial`, bounded by capacity. If saturated, blocks until a slot
    /// frees (`SaturationPolicy::Block`) or returns a one-shot direct
    /// connection (`SaturationPolicy::FailoverDirect`).
    pub async fn get<D, Fut>(&self, dial: D) -> Result<Acquired<S>, PoolError>
    where
        D: Fn() -> Fut,
        Fut: Future<Output = Result<S, PoolError>>,
    {
        if let Some(entry) = self.idle.lock().expect("pool lock poisoned").pop_front() {
            self.borrowed.fetch_add(1, Ordering::SeqCst);
            return Ok(Acquired::Pooled(entry));
        }

        loop {
            let current = self.borrowed.load(Ordering::SeqCst);
            if current < self.capacity {
                // Reserve the slot before dialing so concurrent callers don't
                // all observe room for one more connection.
                if self
                    .borrowed
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return match dial().await {
                        Ok(socket) => Ok(Acquired::Pooled(PoolEntry {
                            socket,
                            last_used: Instant::now(),
                        })),
                        Err(err) => {
                            self.borrowed.fetch_sub(1, Ordering::SeqCst);
                            Err(err)
                        }
                    };
                }
                continue;
            }

            match self.policy {
                SaturationPolicy::FailoverDirect => {
                    return dial().await.map(Acquired::Direct);
                }
                SaturationPolicy::Block => {
                    self.freed.notified().await;
                }
            }
        }
    }

    /// Returns a borrowed socket: put back if healthy and under cap,
    /// otherwise dropped (closed). Retried requests must never call this
    /// with a socket known to be dead.
    pub fn put(&self, mut entry: PoolEntry<S>, healthy: bool) {
        self.borrowed.fetch_sub(1, Ordering::SeqCst);
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        if healthy && idle.len() < self.capacity {
            entry.last_used = Instant::now();
            idle.push_back(entry);
        }
        drop(idle);
        self.freed.notify_one();
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().expect("pool lock poisoned").len()
    }

    pub fn borrowed_len(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }

    /// One keep-alive sweep: pings every idle socket, discarding any whose
    /// ping fails or whose read deadline has already passed.
    pub async fn keep_alive_tick(&self) {
        let mut entries: Vec<PoolEntry<S>> = {
            let mut idle = self.idle.lock().expect("pool lock poisoned");
            idle.drain(..).collect()
        };
        let now = Instant::now();
        let mut survivors = Vec::with_capacity(entries.len());
        for mut entry in entries.drain(..) {
            if entry.socket.read_deadline_expired(now) {
                continue;
            }
            if entry.socket.ping().await {
                survivors.push(entry);
            } else {
                warn!("pooled socket failed keep-alive ping; discarding");
            }
        }
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        idle.extend(survivors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct FakeSocket {
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Socket for FakeSocket {
        async fn ping(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn read_deadline_expired(&self, _now: Instant) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn reuses_returned_socket_instead_of_dialing() {
        let pool: WebSocketPool<FakeSocket> = WebSocketPool::new(2, SaturationPolicy::Block);
        let dial_count = Arc::new(AtomicUsize::new(0));
        let dial = || {
            let dial_count = Arc::clone(&dial_count);
            async move {
                dial_count.fetch_add(1, Ordering::SeqCst);
                Ok(FakeSocket {
                    alive: Arc::new(AtomicBool::new(true)),
                })
            }
        };

        let acquired = pool.get(dial).await.unwrap();
        let Acquired::Pooled(entry) = acquired else {
            panic!("expected pooled");
        };
        pool.put(entry, true);
        assert_eq!(pool.idle_len(), 1);

        pool.get(dial).await.unwrap();
        assert_eq!(dial_count.load(Ordering::SeqCst), 1, "reused idle socket without dialing");
    }

    #[tokio::test]
    async fn unhealthy_socket_is_not_returned_to_pool() {
        let pool: WebSocketPool<FakeSocket> = WebSocketPool::new(2, SaturationPolicy::Block);
        let dial = || async {
            Ok(FakeSocket {
                alive: Arc::new(AtomicBool::new(true)),
            })
        };
        let Acquired::Pooled(entry) = pool.get(dial).await.unwrap() else {
            panic!("expected pooled");
        };
        pool.put(entry, false);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn saturated_pool_fails_over_to_direct_connection() {
        let pool: WebSocketPool<FakeSocket> = WebSocketPool::new(1, SaturationPolicy::FailoverDirect);
        let dial = || async {
            Ok(FakeSocket {
                alive: Arc::new(AtomicBool::new(true)),
            })
        };
        let _first = pool.get(dial).await.unwrap();
        let second = pool.get(dial).await.unwrap();
        assert!(matches!(second, Acquired::Direct(_)));
        assert_eq!(pool.borrowed_len(), 1, "direct connection doesn't count against capacity");
    }

    #[tokio::test]
    async fn keep_alive_drops_dead_sockets() {
        let pool: WebSocketPool<FakeSocket> = WebSocketPool::new(2, SaturationPolicy::Block);
        let alive = Arc::new(AtomicBool::new(true));
        let dial = {
            let alive = Arc::clone(&alive);
            move || {
                let alive = Arc::clone(&alive);
                async move { Ok(FakeSocket { alive }) }
            }
        };
        let Acquired::Pooled(entry) = pool.get(dial).await.unwrap() else {
            panic!("expected pooled");
        };
        pool.put(entry, true);
        alive.store(false, Ordering::SeqCst);
        pool.keep_alive_tick().await;
        assert_eq!(pool.idle_len(), 0);
    }
}
