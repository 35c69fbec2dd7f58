//! Pluggable eviction policy for a [`Client`](crate::client::Client)'s store registry.

use std::sync::Arc;

use crate::client::ClientHandle;
use crate::observer::{MemoryPressureSource, Pressure};
use crate::subscription::Subscription;

/// Attached once, at [`Client::new`](crate::client::Client::new) time, to decide how (if at all)
/// a client reacts to memory pressure by evicting idle stores.
///
/// Implementations receive only a weak [`ClientHandle`], never an owned `Client` — holding a
/// strong reference here would create a cycle (the client would keep its own cache alive, which
/// would keep the client alive) that neither side could ever break.
pub trait StoreCache: Send + Sync {
    /// Wires this cache's eviction policy to `client`, returning a [`Subscription`] that tears it
    /// down when cancelled or dropped along with the client itself.
    fn attach(&self, client: ClientHandle) -> Subscription;

    /// Whether this cache ever evicts anything at all. `Client::evict_at_pressure` consults this
    /// before touching the registry, so a cache that never wires up a pressure reaction (like
    /// [`NoEvictionCache`]) can't be made to evict by a direct call to that method either.
    fn evicts(&self) -> bool {
        true
    }
}

/// A cache that never evicts anything. The default for a [`Client`] built without an explicit
/// policy; stores live until explicitly cleared via [`Client::clear_store`](crate::client::Client::clear_store)
/// or [`Client::clear_stores_matching`](crate::client::Client::clear_stores_matching).
pub struct NoEvictionCache;

impl StoreCache for NoEvictionCache {
    fn attach(&self, _client: ClientHandle) -> Subscription {
        Subscription::empty()
    }

    fn evicts(&self) -> bool {
        false
    }
}

/// A cache that evicts idle, eviction-eligible stores whenever the given
/// [`MemoryPressureSource`] reports a pressure level. A store is idle and eligible exactly when
/// its `EvictWhen` mask (see `context::EvictablePressureKey`) contains the reported level and it
/// has no current subscribers — see [`Client::evict_at_pressure`](crate::client::Client::evict_at_pressure).
pub struct PressureEvictingCache {
    source: Arc<dyn MemoryPressureSource>,
}

impl PressureEvictingCache {
    pub fn new(source: Arc<dyn MemoryPressureSource>) -> Self {
        Self { source }
    }
}

impl StoreCache for PressureEvictingCache {
    fn attach(&self, client: ClientHandle) -> Subscription {
        self.source.subscribe(Box::new(move |pressure: Pressure| {
            if let Some(client) = client.upgrade() {
                client.evict_at_pressure(pressure);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientConfig};
    use crate::continuation::Continuation;
    use crate::context::Context;
    use crate::error::OperationError;
    use crate::modifier::EvictWhen;
    use crate::observer::PressureMask;
    use crate::operation::{QueryAdapter, QueryOperation};
    use crate::path::Path;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Constant;

    #[async_trait]
    impl QueryOperation for Constant {
        type Value = u32;
        type Failure = &'static str;

        fn path(&self) -> Path {
            Path::of("evictable")
        }

        async fn fetch(
            &self,
            _context: Context,
            _continuation: Continuation<u32, &'static str>,
        ) -> Result<u32, OperationError<&'static str>> {
            Ok(42)
        }
    }

    struct FakePressureSource {
        callbacks: Mutex<Vec<Box<dyn Fn(Pressure) + Send + Sync>>>,
    }

    impl FakePressureSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                callbacks: Mutex::new(Vec::new()),
            })
        }

        fn fire(&self, pressure: Pressure) {
            for callback in self.callbacks.lock().iter() {
                callback(pressure);
            }
        }
    }

    impl MemoryPressureSource for FakePressureSource {
        fn subscribe(&self, on_pressure: Box<dyn Fn(Pressure) + Send + Sync>) -> Subscription {
            self.callbacks.lock().push(on_pressure);
            Subscription::empty()
        }
    }

    #[tokio::test]
    async fn no_eviction_cache_never_removes_anything() {
        let client = Client::without_cache();
        client.store(EvictWhen::new(QueryAdapter(Constant), PressureMask::WARNING));
        // Even a direct call to `evict_at_pressure` must be inert under `NoEvictionCache`: the
        // cache's `evicts() == false` gates the whole registry, not just pressure delivered
        // through its own (nonexistent, for this cache) subscription.
        client.evict_at_pressure(Pressure::Warning);
        assert!(client.store_with_path(&Path::of("evictable")).is_some());
    }

    #[tokio::test]
    async fn pressure_evicting_cache_removes_idle_eligible_stores_on_pressure() {
        let source = FakePressureSource::new();
        let cache = Arc::new(PressureEvictingCache::new(source.clone()));
        let client = Client::new(cache, ClientConfig::default());

        client.store(EvictWhen::new(QueryAdapter(Constant), PressureMask::WARNING));
        assert!(client.store_with_path(&Path::of("evictable")).is_some());

        source.fire(Pressure::Warning);
        assert!(client.store_with_path(&Path::of("evictable")).is_none());
    }
}
