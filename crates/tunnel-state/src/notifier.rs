//! Close fan-out.
//!
//! Any number of callers may wait for a connection to close. Each waiter
//! gets its own one-shot channel; `close` swaps the whole set out under
//! the same lock that registration takes, so a waiter either sees the
//! closed flag or is in the set that gets drained. There is no window
//! in between.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

struct Waiters {
    closed: bool,
    pending: Vec<oneshot::Sender<()>>,
}

/// Releases every registered waiter exactly once on close.
pub struct CloseNotifier {
    waiters: Mutex<Waiters>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Waiters {
                closed: false,
                pending: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if close has happened
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of waiters registered and not yet released
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Register a waiter now, to be awaited later.
    ///
    /// Registration happens at call time, not at first poll, so a waiter
    /// obtained before `close` is guaranteed to be released by it.
    pub fn waiter(&self, grace: Duration) -> CloseWaiter {
        let mut waiters = self.lock();
        if waiters.closed {
            return CloseWaiter { rx: None, grace };
        }

        let (tx, rx) = oneshot::channel();
        waiters.pending.push(tx);
        CloseWaiter { rx: Some(rx), grace }
    }

    /// Wait until closed, then sleep `grace`.
    ///
    /// Returns at once if already closed.
    pub async fn wait(&self, grace: Duration) {
        self.waiter(grace).wait().await
    }

    /// Close and release all waiters.
    ///
    /// `on_close` runs under the registration lock, before any waiter is
    /// released. Returns the number of waiters released on the first
    /// call and `None` on every later call.
    pub fn close_with(&self, on_close: impl FnOnce()) -> Option<usize> {
        let mut waiters = self.lock();
        if waiters.closed {
            return None;
        }
        waiters.closed = true;
        on_close();

        let pending = mem::take(&mut waiters.pending);
        // A send fails only when that waiter was dropped.
        let released = pending
            .into_iter()
            .map(|tx| tx.send(()))
            .filter(Result::is_ok)
            .count();

        Some(released)
    }

    /// Close and release all waiters.
    pub fn close(&self) -> Option<usize> {
        self.close_with(|| {})
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered close waiter.
#[must_use = "a waiter does nothing unless awaited"]
pub struct CloseWaiter {
    rx: Option<oneshot::Receiver<()>>,
    grace: Duration,
}

impl CloseWaiter {
    /// Check if the waiter was registered after close
    pub fn is_ready(&self) -> bool {
        self.rx.is_none()
    }

    /// Wait for the release signal.
    pub async fn wait(self) {
        let Some(rx) = self.rx else {
            return;
        };

        if rx.await.is_err() {
            debug!("state: Close notifier dropped before close");
            return;
        }

        tokio::time::sleep(self.grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Instant, timeout};

    #[tokio::test]
    async fn test_close_releases_registered_waiters() {
        let notifier = CloseNotifier::new();
        let waiters: Vec<_> = (0..5).map(|_| notifier.waiter(Duration::ZERO)).collect();

        assert_eq!(notifier.pending(), 5);
        assert_eq!(notifier.close(), Some(5));
        assert_eq!(notifier.pending(), 0);

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter.wait()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let notifier = CloseNotifier::new();
        let runs = AtomicUsize::new(0);

        assert_eq!(notifier.close_with(|| { runs.fetch_add(1, Ordering::SeqCst); }), Some(0));
        assert_eq!(notifier.close_with(|| { runs.fetch_add(1, Ordering::SeqCst); }), None);
        assert_eq!(notifier.close(), None);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(notifier.is_closed());
    }

    #[tokio::test]
    async fn test_wait_after_close_returns_immediately() {
        let notifier = CloseNotifier::new();
        notifier.close();

        let waiter = notifier.waiter(Duration::from_secs(10));
        assert!(waiter.is_ready());
        assert_eq!(notifier.pending(), 0);

        timeout(Duration::from_millis(100), waiter.wait()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_close() {
        let notifier = Arc::new(CloseNotifier::new());
        let waiter = notifier.waiter(Duration::from_millis(50));

        let started = Instant::now();
        let handle = tokio::spawn(waiter.wait());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        notifier.close();
        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(5050));
    }

    #[tokio::test]
    async fn test_dropped_waiter_not_counted() {
        let notifier = CloseNotifier::new();
        let kept = notifier.waiter(Duration::ZERO);
        drop(notifier.waiter(Duration::ZERO));

        assert_eq!(notifier.close(), Some(1));
        kept.wait().await;
    }

    #[tokio::test]
    async fn test_dropped_notifier_releases_waiter() {
        let notifier = CloseNotifier::new();
        let waiter = notifier.waiter(Duration::from_secs(10));
        drop(notifier);

        timeout(Duration::from_millis(100), waiter.wait()).await.unwrap();
    }
}
