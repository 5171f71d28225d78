//! Shared helpers for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// Counts how often a task would have been woken.
pub(crate) struct WakeCounter {
    hits: AtomicUsize,
}

impl WakeCounter {
    pub(crate) fn count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Wake for WakeCounter {
    fn wake(self: Arc<Self>) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Returns a waker plus the counter recording its wakes.
pub(crate) fn counting_waker() -> (Arc<WakeCounter>, Waker) {
    let counter = Arc::new(WakeCounter {
        hits: AtomicUsize::new(0),
    });
    (counter.clone(), Waker::from(counter))
}
