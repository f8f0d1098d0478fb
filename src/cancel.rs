//! Cancellation of blocking waits.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Something blocked on a condition variable that can be woken so it
/// re-examines its cancellation token.
pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

/// A handle that abandons an in-progress `select_server_with` or
/// `acquire_with` call. Cancelled waiters leave without touching cluster or
/// pool state. Clones share the same cancellation flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Weak<dyn Wake>>>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    /// Cancels every wait using this token, now and in the future.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let wakers = match self.inner.wakers.lock() {
            Ok(mut wakers) => wakers.drain(..).collect::<Vec<_>>(),
            Err(_) => return,
        };
        for waker in wakers.iter().filter_map(Weak::upgrade) {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    // Waiters register before checking the flag under their own lock, and
    // wakers take that same lock before notifying, so no wakeup is lost.
    pub(crate) fn register(&self, waker: Weak<dyn Wake>) {
        if let Ok(mut wakers) = self.inner.wakers.lock() {
            wakers.retain(|w| w.upgrade().is_some());
            wakers.push(waker);
        }
    }
}
