use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send>;

/// A one-shot completion handle whose callbacks fire in registration order.
///
/// The compaction pipeline relies on this ordering: retries registered first
/// must observe completion first. `tokio::sync::Notify` makes no promise
/// about waker order, so completion drains an explicit callback list instead.
#[derive(Clone, Default)]
pub struct OrderedNotify {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    done: bool,
    callbacks: Vec<Callback>,
}

impl OrderedNotify {
    pub fn new() -> Self {
        Self::default()
    }

    /// An already-completed handle; every callback runs immediately.
    pub fn completed() -> Self {
        let notify = Self::new();
        notify.complete();
        notify
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().done
    }

    /// Register `f` to run on completion, or immediately if already complete.
    pub fn on_complete(&self, f: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.done {
            drop(inner);
            f();
        } else {
            inner.callbacks.push(Box::new(f));
        }
    }

    /// Complete the handle, running pending callbacks in registration order.
    /// Returns false if it was already complete.
    pub fn complete(&self) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.done {
                return false;
            }
            inner.done = true;
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Wait for completion.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}
