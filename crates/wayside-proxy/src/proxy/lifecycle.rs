//! Shutdown signal and in-flight connection tracking.

use parking_lot::Mutex;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Owns the shutdown token and the set of running connection tasks.
#[derive(Debug, Default)]
pub struct Lifecycle {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    // Serializes spawning against `close`, so nothing is spawned after
    // `close` has started waiting.
    spawn_lock: Mutex<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Spawn a tracked task unless shutdown has started.
    pub fn try_spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _guard = self.spawn_lock.lock();
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.tracker.spawn(fut);
        true
    }

    /// Number of tracked tasks still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Signal shutdown and wait for every tracked task to finish.
    pub async fn close(&self) {
        {
            let _guard = self.spawn_lock.lock();
            self.shutdown.cancel();
            self.tracker.close();
        }
        info!(in_flight = self.tracker.len(), "Waiting for in-flight connections to drain");
        self.tracker.wait().await;
        info!("All connections drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_waits_for_in_flight() {
        let lifecycle = Arc::new(Lifecycle::new());
        let finished = Arc::new(AtomicBool::new(false));

        let done = finished.clone();
        let token = lifecycle.token().clone();
        assert!(lifecycle.try_spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.store(true, Ordering::SeqCst);
        }));
        assert_eq!(lifecycle.active(), 1);

        lifecycle.close().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(lifecycle.active(), 0);
        assert!(lifecycle.closing());
    }

    #[tokio::test]
    async fn test_no_spawn_after_close() {
        let lifecycle = Lifecycle::new();
        lifecycle.close().await;
        assert!(!lifecycle.try_spawn(async {}));
        assert_eq!(lifecycle.active(), 0);
    }

    #[tokio::test]
    async fn test_close_twice_returns() {
        let lifecycle = Lifecycle::new();
        lifecycle.close().await;
        lifecycle.close().await;
    }
}
