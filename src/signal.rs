//! Cancellation broadcast and live-worker accounting.
//!
//! `CancelSignal` is the single per-request broadcast that unifies user
//! cancel, TTL expiry, accept-satisfied early stop, stage-construction
//! cleanup, and shutdown. Cancelling twice is a no-op.
//!
//! `WorkerGauge` counts live workers and lets a producer block until the
//! count drops below a cap. Waiters park on a `Notify` rather than spinning.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

struct CancelInner {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

/// Idempotent broadcast cancel. Cloning shares the same underlying signal.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                fired: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Fire the signal. Returns true only for the call that actually fired
    /// it; repeats are no-ops.
    pub fn cancel(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.tx.send(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the signal fires; immediately if it already has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.inner.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("fired", &self.is_cancelled())
            .finish()
    }
}

/// Live-worker counter with "block until below N" semantics.
#[derive(Debug, Default)]
pub struct WorkerGauge {
    count: AtomicUsize,
    notify: Notify,
}

impl WorkerGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Register one live worker.
    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Unregister one live worker and wake waiters.
    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "WorkerGauge underflow");
        self.notify.notify_waiters();
    }

    /// RAII variant of `add`; the returned ticket calls `done` on drop.
    pub fn enter(self: Arc<Self>) -> WorkerTicket {
        self.add();
        WorkerTicket { gauge: self }
    }

    /// Park until the live count is strictly below `limit`.
    pub async fn wait_below(&self, limit: usize) {
        loop {
            // Register the waiter before re-checking so a concurrent `done`
            // cannot slip between the check and the await.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current() < limit {
                return;
            }
            notified.await;
        }
    }

    /// Park until every worker has exited.
    pub async fn wait_idle(&self) {
        self.wait_below(1).await;
    }
}

/// Drop guard produced by `WorkerGauge::enter`.
pub struct WorkerTicket {
    gauge: Arc<WorkerGauge>,
}

impl Drop for WorkerTicket {
    fn drop(&mut self) {
        self.gauge.done();
    }
}
