//! Hand-written, deterministic test doubles for the contracts in [`crate::observer`] and
//! [`crate::context`], used by this crate's own test suite and available to downstream crates
//! testing code built on top of [`Store`](crate::store::Store)/[`Client`](crate::client::Client).
//!
//! No mocking framework is pulled in for these — each double is a few lines of state plus a
//! callback list, and is more informative on failure than a generated mock would be.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::{Clock, Delayer, Timestamp};
use crate::observer::{ApplicationActivityObserver, ConnectionStatus, MemoryPressureSource, NetworkObserver, Pressure};
use crate::subscription::Subscription;

/// A [`Clock`] whose value only advances when [`set`](FakeClock::set)/[`advance`](FakeClock::advance)
/// is called, so tests can assert on `value_last_updated_at` deterministically.
#[derive(Default)]
pub struct FakeClock {
    millis: AtomicI64,
}

impl FakeClock {
    pub fn new(initial: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(initial.0),
        })
    }

    pub fn set(&self, value: Timestamp) {
        self.millis.store(value.0, Ordering::SeqCst);
    }

    pub fn advance(&self, duration: Duration) {
        self.millis.fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

/// A [`Delayer`] that never actually sleeps: it resolves as soon as it's polled, while still
/// honoring cancellation and counting how many delays it was asked to wait out. Lets `Retry`
/// backoff tests run in microseconds instead of racing real timers.
#[derive(Default)]
pub struct NoDelay {
    calls: AtomicU32,
}

impl NoDelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delayer for NoDelay {
    async fn delay(&self, _duration: Duration, cancel: &CancellationToken) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

/// A [`NetworkObserver`] whose reported status is driven entirely by test code via [`set`](FakeNetworkObserver::set).
pub struct FakeNetworkObserver {
    status: Mutex<ConnectionStatus>,
    subscribers: Mutex<Vec<Box<dyn Fn(ConnectionStatus) + Send + Sync>>>,
}

impl FakeNetworkObserver {
    pub fn new(initial: ConnectionStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
        for subscriber in self.subscribers.lock().iter() {
            subscriber(status);
        }
    }
}

impl NetworkObserver for FakeNetworkObserver {
    fn current_status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn subscribe(&self, on_change: Box<dyn Fn(ConnectionStatus) + Send + Sync>) -> Subscription {
        self.subscribers.lock().push(on_change);
        Subscription::empty()
    }
}

/// An [`ApplicationActivityObserver`] whose reported activity is driven by test code via
/// [`set`](FakeApplicationActivityObserver::set).
pub struct FakeApplicationActivityObserver {
    active: Mutex<bool>,
    subscribers: Mutex<Vec<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl FakeApplicationActivityObserver {
    pub fn new(initially_active: bool) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(initially_active),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, active: bool) {
        *self.active.lock() = active;
        for subscriber in self.subscribers.lock().iter() {
            subscriber(active);
        }
    }
}

impl ApplicationActivityObserver for FakeApplicationActivityObserver {
    fn is_active(&self) -> bool {
        *self.active.lock()
    }

    fn subscribe(&self, on_change: Box<dyn Fn(bool) + Send + Sync>) -> Subscription {
        self.subscribers.lock().push(on_change);
        Subscription::empty()
    }
}

/// A [`MemoryPressureSource`] whose pressure events are fired by test code via [`fire`](FakeMemoryPressureSource::fire).
pub struct FakeMemoryPressureSource {
    subscribers: Mutex<Vec<Box<dyn Fn(Pressure) + Send + Sync>>>,
}

impl FakeMemoryPressureSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn fire(&self, pressure: Pressure) {
        for subscriber in self.subscribers.lock().iter() {
            subscriber(pressure);
        }
    }
}

impl MemoryPressureSource for FakeMemoryPressureSource {
    fn subscribe(&self, on_pressure: Box<dyn Fn(Pressure) + Send + Sync>) -> Subscription {
        self.subscribers.lock().push(on_pressure);
        Subscription::empty()
    }
}
