//! Heartbeat watchdog
//!
//! Fires once when no report arrives within the window. Every
//! [`Watchdog::feed`] restarts the window.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Running watchdog; dropping it stops the timer
#[derive(Debug)]
pub struct Watchdog {
    fed: Arc<Notify>,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Start a watchdog calling `on_expire` after `window` of silence
    pub fn start<F>(window: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let fed = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let task_fed = fed.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = task_fed.notified() => continue,
                    _ = tokio::time::sleep(window) => {
                        tracing::warn!("No heartbeat for {}ms", window.as_millis());
                        on_expire();
                        return;
                    }
                }
            }
        });

        Self { fed, cancel }
    }

    /// Record a report
    pub fn feed(&self) {
        self.fed.notify_one();
    }

    /// Stop without firing
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the watchdog was stopped
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_window() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _watchdog = Watchdog::start(Duration::from_millis(10_000), move || {
            flag.store(true, Ordering::SeqCst)
        });

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeding_postpones_expiry() {
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let watchdog = Watchdog::start(Duration::from_millis(10_000), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(2_000)).await;
            watchdog.feed();
        }
        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let watchdog = Watchdog::start(Duration::from_millis(1_000), move || {
            flag.store(true, Ordering::SeqCst)
        });
        watchdog.stop();
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(watchdog.is_stopped());
    }
}
