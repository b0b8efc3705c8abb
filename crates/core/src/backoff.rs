//! Single-shot, rearmable scheduled callback with tries-indexed delays
//! (§4.A). Used for both reconnect and per-channel rejoin scheduling.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// `tries` (1-indexed) -> delay before the next firing.
pub type DelayFn = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

/// The default schedule named in §4.A: `[1s, 2s, 5s, 10s]` then 10s.
pub fn default_delay_fn() -> DelayFn {
    Arc::new(|tries: u64| {
        const SCHEDULE_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];
        let idx = (tries.saturating_sub(1)) as usize;
        let ms = SCHEDULE_MS.get(idx).copied().unwrap_or(10_000);
        Duration::from_millis(ms)
    })
}

/// A timer that fires at most once per `schedule()` call, at a delay
/// computed from how many times it has fired before.
///
/// Invariant: at any moment at most one pending firing is outstanding —
/// `schedule()` cancels whatever was previously armed before arming a
/// new one.
pub struct BackoffTimer {
    delay_fn: DelayFn,
    tries: Arc<Mutex<u64>>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BackoffTimer {
    pub fn new(delay_fn: DelayFn) -> Self {
        Self {
            delay_fn,
            tries: Arc::new(Mutex::new(0)),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// (Re)arms the timer: cancels any prior schedule, increments
    /// `tries`, and fires `callback` after `delay_fn(tries)`.
    pub async fn schedule<F>(&self, callback: F)
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        let mut guard = self.handle.lock().await;
        if let Some(prev) = guard.take() {
            prev.abort();
        }

        let mut tries = self.tries.lock().await;
        *tries += 1;
        let delay = (self.delay_fn)(*tries);
        drop(tries);

        let new_handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        });
        *guard = Some(new_handle);
    }

    /// Cancels any pending schedule and resets `tries` to 0.
    pub async fn reset(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(prev) = guard.take() {
            prev.abort();
        }
        let mut tries = self.tries.lock().await;
        *tries = 0;
    }

    pub async fn tries(&self) -> u64 {
        *self.tries.lock().await
    }
}
