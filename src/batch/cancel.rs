//! Cooperative cancellation
//!
//! One token is created per batch run and shared by every in-flight
//! session. `trip()` is idempotent; `is_tripped()` is a lock-free read for
//! the hot path, and `cancelled()` is the awaitable form used inside
//! `tokio::select!` at every suspension point. Tokens are not reusable:
//! tripping after the run has returned is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    tripped: AtomicBool,
    tx: watch::Sender<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tripped: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Signal cancellation. Safe to call from any thread, any number of times.
    pub fn trip(&self) {
        if !self.inner.tripped.swap(true, Ordering::SeqCst) {
            let _ = self.inner.tx.send(true);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    /// Resolves once the token trips; resolves immediately if already tripped.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.tx.subscribe();
        while !*rx.borrow_and_update() {
            // The sender lives inside self, so changed() cannot fail here
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Identity comparison, used by the engine to clear only its own
    /// still-active token.
    pub(crate) fn same_token(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("tripped", &self.is_tripped())
            .finish()
    }
}
