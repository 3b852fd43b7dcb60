//! Cooperative cancellation.
//!
//! A [`CancellationTokenSource`] owns the right to cancel; every clone of its
//! [`CancellationToken`] observes the same state. Callbacks registered on a
//! token run exactly once: immediately if the token is already cancelled,
//! otherwise on the first `cancel` call.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Callback = Box<dyn FnOnce(Option<String>) + Send>;

struct TokenState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    notify: tokio_util::sync::CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                notify: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }

    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self::new()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        lock(&self.state.reason).clone()
    }

    /// Register a one-shot callback. Fires immediately when already
    /// cancelled. Dispose the returned registration to drop the callback
    /// without it firing.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut callbacks = lock(&self.state.callbacks);
            if !self.is_cancelled() {
                callbacks.push((id, Box::new(callback)));
                return Registration {
                    id,
                    state: Arc::downgrade(&self.state),
                };
            }
        }
        invoke(Box::new(callback), self.reason());
        Registration {
            id,
            state: std::sync::Weak::new(),
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.state.notify.cancelled().await
    }

    fn cancel(&self, reason: Option<String>) -> bool {
        {
            // Reason is written before the flag flips so that callbacks and
            // observers of `is_cancelled` always see it.
            let mut current = lock(&self.state.reason);
            if self.state.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            *current = reason.clone();
            self.state.cancelled.store(true, Ordering::SeqCst);
        }

        let callbacks = std::mem::take(&mut *lock(&self.state.callbacks));
        for (_, callback) in callbacks {
            invoke(callback, reason.clone());
        }
        self.state.notify.cancel();
        true
    }
}

fn invoke(callback: Callback, reason: Option<String>) {
    if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
        tracing::error!("cancellation callback panicked");
    }
}

/// Handle to a registered callback.
pub struct Registration {
    id: u64,
    state: std::sync::Weak<TokenState>,
}

impl Registration {
    /// Remove the callback if it has not fired yet.
    pub fn dispose(self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state.callbacks).retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Clone, Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Idempotent. Returns false when the source was already cancelled.
    pub fn cancel(&self, reason: Option<String>) -> bool {
        self.token.cancel(reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drop every pending callback without firing it.
    pub fn dispose(&self) {
        lock(&self.token.state.callbacks).clear();
    }
}
