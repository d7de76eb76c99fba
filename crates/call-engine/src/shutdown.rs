//! Cooperative shutdown signalling.
//!
//! One [`ShutdownGuard`] is shared by every stateful component; the flag is
//! checked at each suspension point so new work is rejected fail-fast while
//! already-queued work drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Shared shutting-down flag with wakeup for parked periodic tasks.
#[derive(Clone, Default)]
pub struct ShutdownGuard {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    shutting_down: AtomicBool,
    notify: Notify,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Flip the flag and wake everything parked on [`wait`](Self::wait).
    /// Idempotent; returns whether this call was the one that triggered it.
    pub fn trigger(&self) -> bool {
        let first = !self.inner.shutting_down.swap(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        first
    }

    /// Park until shutdown is triggered.
    pub async fn wait(&self) {
        if self.is_shutting_down() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }
}
