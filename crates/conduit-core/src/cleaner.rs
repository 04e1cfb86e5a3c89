//! A periodic background task runner with panic isolation and an idempotent,
//! responsive `stop()`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

const MIN_INTERVAL: Duration = Duration::from_millis(50);

type Task = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Runs `task` on a fixed interval until stopped. A single worker is spawned
/// per `Start` call; `Stop` is safe to call more than once and always waits
/// for the worker (including any in-flight invocation of `task`) to exit.
pub struct AsyncCleaner {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
    stopped: Arc<AtomicBool>,
    // Used so Stop doesn't return until the worker has actually observed the
    // stop signal, even if it's mid-tick.
    exited: Arc<Notify>,
}

impl AsyncCleaner {
    pub fn new(interval: Duration) -> Self {
        let interval = if interval <= Duration::ZERO {
            MIN_INTERVAL
        } else {
            interval
        };
        Self {
            interval,
            handle: None,
            stop_tx: None,
            stopped: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(Notify::new()),
        }
    }

    /// Spawns the worker. Calling `start` again before `stop` replaces the
    /// previous worker's stop channel, leaking the old task; callers should
    /// `stop` before restarting.
    pub fn start<F, Fut>(&mut self, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: Task = Box::new(move || Box::pin(task()));
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let interval = self.interval;
        let exited = Arc::clone(&self.exited);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Re-check the stop signal after the tick fires so
                        // Stop is responsive within one tick even if the
                        // ticker and the stop race.
                        if stop_rx.try_recv().is_ok() {
                            break;
                        }
                        run_with_panic_isolation(&task).await;
                    }
                    _ = &mut stop_rx => {
                        break;
                    }
                }
            }
            exited.notify_waiters();
        });

        self.handle = Some(handle);
        self.stop_tx = Some(stop_tx);
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Idempotent: a second call is a no-op. Waits for the worker (and any
    /// task invocation in flight) to exit before returning.
    pub async fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run_with_panic_isolation(task: &Task) {
    // AssertUnwindSafe: the task closure only captures shared, Sync state
    // (stores behind Arc); a panic mid-task leaves no exclusive borrow for
    // the next tick to observe in a torn state.
    let result = AssertUnwindSafe(task()).catch_unwind().await;
    if let Err(panic) = result {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(panic = %message, "periodic task panicked; cleaner worker continues");
    }
}

impl Drop for AsyncCleaner {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn ticks_invoke_task_and_stop_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cleaner = AsyncCleaner::new(Duration::from_millis(10));
        {
            let calls = Arc::clone(&calls);
            cleaner.start(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;

        cleaner.stop().await;
        cleaner.stop().await; // idempotent, must not hang or panic

        let after_stop = calls.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop, "no ticks after stop");
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cleaner = AsyncCleaner::new(Duration::from_millis(5));
        {
            let calls = Arc::clone(&calls);
            cleaner.start(move || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        panic!("boom");
                    }
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        cleaner.stop().await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn non_positive_interval_clamped() {
        let cleaner = AsyncCleaner::new(Duration::ZERO);
        assert_eq!(cleaner.interval, MIN_INTERVAL);
    }
}
