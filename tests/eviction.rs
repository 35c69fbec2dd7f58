//! End-to-end coverage for pressure-driven eviction (S6): on a pressure event, exactly the stores
//! that are both eligible (`EvictWhen` mask contains the reported level) and idle (no
//! subscribers) are removed from the client's registry.

use async_trait::async_trait;
use opcore::context::Context;
use opcore::error::OperationError;
use opcore::observer::{Pressure, PressureMask};
use opcore::operation::{QueryAdapter, QueryOperation};
use opcore::path::Path;
use opcore::test_support::FakeMemoryPressureSource;
use opcore::{Client, ClientConfig, Continuation, EvictWhen, PressureEvictingCache};
use pretty_assertions::assert_eq;

struct Constant(u32);

#[async_trait]
impl QueryOperation for Constant {
    type Value = u32;
    type Failure = &'static str;

    fn path(&self) -> Path {
        Path::of("eviction-scenario").append(self.0)
    }

    async fn fetch(
        &self,
        _context: Context,
        _continuation: Continuation<u32, &'static str>,
    ) -> Result<u32, OperationError<&'static str>> {
        Ok(self.0)
    }
}

#[tokio::test]
async fn a_pressure_event_evicts_exactly_the_eligible_idle_stores() {
    let source = FakeMemoryPressureSource::new();
    let cache = std::sync::Arc::new(PressureEvictingCache::new(source.clone()));
    let client = Client::new(cache, ClientConfig::default());

    // A: eligible at Warning, idle.
    client.store(EvictWhen::new(QueryAdapter(Constant(1)), PressureMask::WARNING));
    // B: eligible at Warning, but has a live subscriber.
    let b = client.store(EvictWhen::new(QueryAdapter(Constant(2)), PressureMask::WARNING));
    let _subscription = b.subscribe(|_| {});
    // C: not eligible at any pressure level (no `EvictWhen` applied).
    client.store(QueryAdapter(Constant(3)));

    source.fire(Pressure::Warning);

    assert!(client.store_with_path(&Path::of("eviction-scenario").append(1u32)).is_none());
    assert!(client.store_with_path(&Path::of("eviction-scenario").append(2u32)).is_some());
    assert!(client.store_with_path(&Path::of("eviction-scenario").append(3u32)).is_some());
}

#[tokio::test]
async fn a_lower_severity_event_does_not_evict_a_critical_only_store() {
    let source = FakeMemoryPressureSource::new();
    let cache = std::sync::Arc::new(PressureEvictingCache::new(source.clone()));
    let client = Client::new(cache, ClientConfig::default());

    client.store(EvictWhen::new(QueryAdapter(Constant(9)), PressureMask::CRITICAL));
    source.fire(Pressure::Warning);

    assert!(client.store_with_path(&Path::of("eviction-scenario").append(9u32)).is_some());

    source.fire(Pressure::Critical);
    assert!(client.store_with_path(&Path::of("eviction-scenario").append(9u32)).is_none());
}
