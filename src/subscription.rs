//! Cancellable, combinable teardown handles.

use std::sync::Arc;

use parking_lot::Mutex;

/// A handle returned by every `subscribe`-shaped API in this crate. Dropping it does nothing;
/// teardown only happens when [`cancel`](Subscription::cancel) is called explicitly, or the
/// subscription is folded into a [`combined`](Subscription::combined) group that is cancelled.
pub struct Subscription {
    cancel: Box<dyn FnMut() + Send>,
    cancelled: bool,
}

impl Subscription {
    /// Wraps a teardown closure. `on_cancel` runs at most once, even across repeated
    /// [`cancel`](Subscription::cancel) calls.
    pub fn new(on_cancel: impl FnMut() + Send + 'static) -> Self {
        Self {
            cancel: Box::new(on_cancel),
            cancelled: false,
        }
    }

    /// A subscription whose teardown does nothing.
    pub fn empty() -> Self {
        Self::new(|| {})
    }

    /// Runs the teardown closure, if it hasn't already run.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            (self.cancel)();
            self.cancelled = true;
        }
    }

    /// Folds several subscriptions into one; cancelling the result cancels all of them, in order.
    pub fn combined(subscriptions: Vec<Subscription>) -> Self {
        let remaining = Arc::new(Mutex::new(subscriptions));
        Self::new(move || {
            for subscription in remaining.lock().iter_mut() {
                subscription.cancel();
            }
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_runs_the_teardown_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let mut sub = Subscription::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        sub.cancel();
        sub.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn combined_cancels_every_member() {
        let count = Arc::new(AtomicUsize::new(0));
        let make = || {
            let count = count.clone();
            Subscription::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        let mut combined = Subscription::combined(vec![make(), make(), make()]);
        combined.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn empty_cancel_is_a_no_op() {
        let mut sub = Subscription::empty();
        sub.cancel();
    }
}
