//! One-shot readiness signals used to express "blocked until X".
//!
//! A [`Readiness`] starts unset and becomes ready exactly once. Components that
//! block repeatedly hand out a fresh signal each time the condition becomes
//! false again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Inner {
    name: &'static str,
    ready: AtomicBool,
    notify: Notify,
}

#[derive(Clone)]
pub struct Readiness {
    inner: Arc<Inner>,
}

impl Readiness {
    /// Create an unset signal
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                ready: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a signal that is already set
    pub fn ready(name: &'static str) -> Self {
        let readiness = Self::new(name);
        readiness.set_ready();
        readiness
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Mark ready and wake every waiter. Further calls are no-ops.
    pub fn set_ready(&self) {
        if !self.inner.ready.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolve once the signal is set
    pub async fn wait(&self) {
        if self.is_ready() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_ready() {
            return;
        }
        notified.await;
    }

    /// Whether both handles refer to the same signal
    pub fn same_as(&self, other: &Readiness) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("name", &self.inner.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Await whichever of `signals` becomes ready first
pub async fn wait_any(signals: &[Readiness]) {
    if signals.is_empty() || signals.iter().any(Readiness::is_ready) {
        return;
    }
    let waits = signals.iter().map(|signal| Box::pin(signal.wait()));
    futures::future::select_all(waits).await;
}
