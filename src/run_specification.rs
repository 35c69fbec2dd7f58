//! An observable boolean predicate, composable with `&`, `|`, and `!`.
//!
//! A [`RunSpecification`] gates whether an operation is allowed to run automatically (on first
//! subscriber, on becoming stale, ...). It is cheap to clone and evaluate, and notifies
//! subscribers only when its satisfied-ness actually changes — consecutive notifications of the
//! same value are suppressed, so a combinator doesn't need to reason about its children's
//! individual update cadence.

use std::ops::{BitAnd, BitOr, Not};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::subscription::Subscription;

type Callback = Box<dyn Fn(bool) + Send + Sync>;

trait Observable: Send + Sync {
    fn is_satisfied(&self) -> bool;
    fn subscribe(&self, on_change: Callback) -> Subscription;
}

struct Constant(bool);

impl Observable for Constant {
    fn is_satisfied(&self) -> bool {
        self.0
    }

    fn subscribe(&self, on_change: Callback) -> Subscription {
        // A constant never changes after the immediate replay; nothing to tear down.
        on_change(self.0);
        Subscription::empty()
    }
}

struct CellInner {
    value: AtomicBool,
    subscribers: Arc<Mutex<Vec<(u64, Callback)>>>,
    counter: AtomicU64,
}

impl CellInner {
    fn notify(&self, value: bool) {
        for (_, callback) in self.subscribers.lock().iter() {
            callback(value);
        }
    }
}

impl Observable for CellInner {
    fn is_satisfied(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }

    fn subscribe(&self, on_change: Callback) -> Subscription {
        on_change(self.is_satisfied());
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push((id, on_change));
        let subscribers = self.subscribers.clone();
        Subscription::new(move || {
            subscribers.lock().retain(|(sid, _)| *sid != id);
        })
    }
}

/// A mutable, externally-driven [`RunSpecification`] primitive. Produced by
/// [`RunSpecification::cell`]; holders (typically an observer bridge) call
/// [`set`](RunSpecificationHandle::set) to push new values, deduping consecutive repeats.
pub struct RunSpecificationHandle {
    inner: Arc<CellInner>,
}

impl RunSpecificationHandle {
    /// Updates the cell's value. A no-op if `value` equals the current value.
    pub fn set(&self, value: bool) {
        let previous = self.inner.value.swap(value, Ordering::SeqCst);
        if previous != value {
            self.inner.notify(value);
        }
    }
}

/// An observable boolean predicate.
#[derive(Clone)]
pub struct RunSpecification(Arc<dyn Observable>);

impl RunSpecification {
    /// A predicate that never changes.
    pub fn always(value: bool) -> Self {
        Self(Arc::new(Constant(value)))
    }

    /// A mutable primitive plus the handle used to drive it.
    pub fn cell(initial: bool) -> (Self, RunSpecificationHandle) {
        let inner = Arc::new(CellInner {
            value: AtomicBool::new(initial),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            counter: AtomicU64::new(0),
        });
        (Self(inner.clone()), RunSpecificationHandle { inner })
    }

    /// Current satisfied-ness.
    pub fn is_satisfied(&self) -> bool {
        self.0.is_satisfied()
    }

    /// Registers `on_change` to be called whenever `is_satisfied()` changes. Cancelling the
    /// returned subscription stops further notifications.
    pub fn subscribe(&self, on_change: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        self.0.subscribe(Box::new(on_change))
    }
}

struct And(RunSpecification, RunSpecification);

impl Observable for And {
    fn is_satisfied(&self) -> bool {
        self.0.is_satisfied() && self.1.is_satisfied()
    }

    fn subscribe(&self, on_change: Callback) -> Subscription {
        combine_subscribe(&self.0, &self.1, on_change, |a, b| a && b)
    }
}

struct Or(RunSpecification, RunSpecification);

impl Observable for Or {
    fn is_satisfied(&self) -> bool {
        self.0.is_satisfied() || self.1.is_satisfied()
    }

    fn subscribe(&self, on_change: Callback) -> Subscription {
        combine_subscribe(&self.0, &self.1, on_change, |a, b| a || b)
    }
}

struct Negated(RunSpecification);

impl Observable for Negated {
    fn is_satisfied(&self) -> bool {
        !self.0.is_satisfied()
    }

    fn subscribe(&self, on_change: Callback) -> Subscription {
        let on_change = Arc::new(on_change);
        let initial = self.is_satisfied();
        let last = Arc::new(AtomicBool::new(initial));
        on_change(initial);
        let source = self.0.clone();
        self.0.subscribe(move |_| {
            let next = !source.is_satisfied();
            if last.swap(next, Ordering::SeqCst) != next {
                on_change(next);
            }
        })
    }
}

/// Subscribes to both operands, recomputing `combine(a, b)` on every change from either side, and
/// suppressing the callback when the combined value hasn't actually moved.
fn combine_subscribe(
    a: &RunSpecification,
    b: &RunSpecification,
    on_change: Callback,
    combine: fn(bool, bool) -> bool,
) -> Subscription {
    let on_change = Arc::new(on_change);
    let initial = combine(a.is_satisfied(), b.is_satisfied());
    let last = Arc::new(AtomicBool::new(initial));
    on_change(initial);

    let sub_a = {
        let a = a.clone();
        let b = b.clone();
        let on_change = on_change.clone();
        let last = last.clone();
        a.subscribe(move |_| {
            let next = combine(a.is_satisfied(), b.is_satisfied());
            if last.swap(next, Ordering::SeqCst) != next {
                on_change(next);
            }
        })
    };
    let sub_b = {
        let a = a.clone();
        let b = b.clone();
        b.subscribe(move |_| {
            let next = combine(a.is_satisfied(), b.is_satisfied());
            if last.swap(next, Ordering::SeqCst) != next {
                on_change(next);
            }
        })
    };
    Subscription::combined(vec![sub_a, sub_b])
}

impl BitAnd for RunSpecification {
    type Output = RunSpecification;

    fn bitand(self, rhs: Self) -> Self::Output {
        RunSpecification(Arc::new(And(self, rhs)))
    }
}

impl BitOr for RunSpecification {
    type Output = RunSpecification;

    fn bitor(self, rhs: Self) -> Self::Output {
        RunSpecification(Arc::new(Or(self, rhs)))
    }
}

impl Not for RunSpecification {
    type Output = RunSpecification;

    fn not(self) -> Self::Output {
        RunSpecification(Arc::new(Negated(self)))
    }
}
