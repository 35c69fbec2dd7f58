//! The process-wide registry mapping a [`Path`] to its [`Store`], plus pattern-matched retrieval
//! and atomic bulk mutation.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

use crate::cache::StoreCache;
use crate::context::{
    Clock, ClockKey, Context, DelayerKey, Delayer, EvictablePressureKey, IssueHandlerKey, MaxRetriesKey,
};
use crate::error::{ClientError, ClientIssue};
use crate::infinite_store::InfiniteQueryStore;
use crate::observer::{Pressure, PressureMask};
use crate::operation::{InfiniteQueryAdapter, InfiniteQueryOperation, Operation};
use crate::path::Path;
use crate::store::{AnyStore, Store};
use crate::subscription::Subscription;

/// The initial context overrides installed on every store a [`Client`] creates, layered under
/// any per-operation [`Operation::setup`] overrides. Analogous to a teacher-style `*Config`
/// struct: a plain, `Default`-derived value consumed by a constructor, with no env/CLI surface.
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub max_retries: Option<u32>,
    pub delayer: Option<Arc<dyn Delayer>>,
    pub clock: Option<Arc<dyn Clock>>,
    pub evictable_pressure: Option<PressureMask>,
    /// Installed alongside the crate's own `tracing::warn!` whenever a [`ClientIssue`] occurs —
    /// never in place of it.
    pub issue_handler: Option<Arc<dyn Fn(ClientIssue) + Send + Sync>>,
}

impl ClientConfig {
    /// A posture that raises the default retry ceiling well above the per-modifier default,
    /// useful for hosts whose operations talk to flaky backends and would rather lean on a
    /// generous hard cap than tune every `Retry` modifier individually.
    pub fn aggressive_retry() -> Self {
        Self {
            max_retries: Some(8),
            ..Default::default()
        }
    }

    /// A posture for hosts that never want automatic eviction or a deep retry ceiling — every
    /// store survives memory pressure and every failure surfaces after a single attempt unless
    /// the operation's own modifiers say otherwise.
    pub fn manual_only() -> Self {
        Self {
            max_retries: Some(0),
            evictable_pressure: Some(PressureMask::NONE),
            ..Default::default()
        }
    }

    /// The context this config seeds onto every store the owning `Client` creates. Unset fields
    /// leave the corresponding key's own default (or the operation's `setup` override) in place.
    pub fn to_context(&self) -> Context {
        let mut context = Context::new();
        if let Some(max_retries) = self.max_retries {
            context.set::<MaxRetriesKey>(max_retries);
        }
        if let Some(delayer) = &self.delayer {
            context.set::<DelayerKey>(delayer.clone());
        }
        if let Some(clock) = &self.clock {
            context.set::<ClockKey>(clock.clone());
        }
        if let Some(mask) = self.evictable_pressure {
            context.set::<EvictablePressureKey>(mask);
        }
        if let Some(handler) = &self.issue_handler {
            context.set::<IssueHandlerKey>(Some(handler.clone()));
        }
        context
    }
}

struct StoreEntry {
    type_id: TypeId,
    store: Arc<dyn AnyStore>,
}

#[derive(Default)]
struct ClientState {
    entries: HashMap<Path, StoreEntry>,
}

struct ClientInner {
    state: ReentrantMutex<RefCell<ClientState>>,
    config: ClientConfig,
    cache_subscription: Mutex<Option<Subscription>>,
    evicts: bool,
}

/// A process-wide registry mapping a structured [`Path`] to the [`Store`] for that operation.
///
/// Cloning a `Client` clones the handle; every clone shares the same underlying registry. Stores
/// hold only a [`ClientHandle`](ClientHandle) (a weak back-reference) in their context, never a
/// strong `Client`, so a client and the stores it created can't keep each other alive forever.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(cache: Arc<dyn StoreCache>, config: ClientConfig) -> Self {
        let inner = Arc::new(ClientInner {
            state: ReentrantMutex::new(RefCell::new(ClientState::default())),
            config,
            cache_subscription: Mutex::new(None),
            evicts: cache.evicts(),
        });
        let client = Self { inner };
        let subscription = cache.attach(client.handle());
        *client.inner.cache_subscription.lock() = Some(subscription);
        client
    }

    /// A client with no eviction policy at all — every store it creates lives until explicitly
    /// cleared, regardless of memory pressure or `EvictWhen`.
    pub fn without_cache() -> Self {
        Self::new(Arc::new(crate::cache::NoEvictionCache), ClientConfig::default())
    }

    /// A weak back-reference suitable for storing in a run's `Context` (see
    /// `context::ClientHandleKey`) without creating a reference cycle with the stores this client
    /// owns.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle(Arc::downgrade(&self.inner))
    }

    /// Returns the typed store for `operation`'s path, creating it (seeded with this client's
    /// [`ClientConfig`] overrides, then the operation's own `setup`) on first request. If an
    /// entry already exists at that path under a different concrete store type, the mismatch is
    /// reported via `tracing::warn!` and a fresh, unregistered store is returned instead of
    /// crashing or silently corrupting the existing entry.
    pub fn store<Op>(&self, operation: Op) -> Store<Op>
    where
        Op: Operation,
        Op::Value: Clone,
        Op::Failure: Clone,
    {
        let path = operation.path();
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();

        if let Some(entry) = state.entries.get(&path) {
            if entry.type_id == TypeId::of::<Store<Op>>() {
                if let Some(store) = entry.store.as_any().downcast_ref::<Store<Op>>() {
                    return store.clone();
                }
            }
            self.report_issue(ClientIssue::DuplicatePath { path: path.clone() });
            return Store::with_base_context(operation, self.base_context());
        }

        let store = Store::with_base_context(operation, self.base_context());
        state.entries.insert(
            path,
            StoreEntry {
                type_id: TypeId::of::<Store<Op>>(),
                store: Arc::new(store.clone()),
            },
        );
        store
    }

    /// Returns the typed [`InfiniteQueryStore`] for `operation`'s path, creating it on first
    /// request. See [`store`](Client::store) for the duplicate-path recovery behavior.
    pub fn infinite_query_store<Q>(&self, operation: Q) -> InfiniteQueryStore<Q>
    where
        Q: InfiniteQueryOperation,
        Q::PageValue: Clone,
        Q::Failure: Clone,
    {
        let path = operation.path();
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();

        if let Some(entry) = state.entries.get(&path) {
            if entry.type_id == TypeId::of::<InfiniteQueryStore<Q>>() {
                if let Some(store) = entry.store.as_any().downcast_ref::<InfiniteQueryStore<Q>>() {
                    return store.clone();
                }
            }
            self.report_issue(ClientIssue::DuplicatePath { path: path.clone() });
            return InfiniteQueryStore::with_base_context(operation, self.base_context());
        }

        let store = InfiniteQueryStore::with_base_context(operation, self.base_context());
        state.entries.insert(
            path,
            StoreEntry {
                type_id: TypeId::of::<InfiniteQueryStore<Q>>(),
                store: Arc::new(store.clone()),
            },
        );
        store
    }

    /// Same as [`infinite_query_store`](Client::infinite_query_store), but dispatches each page
    /// fetch through `wrap(InfiniteQueryAdapter(operation))` instead of a bare
    /// `InfiniteQueryAdapter` — letting `Retry`, `Dedup`, `Suspend`, or `LogDuration` wrap
    /// pagination the same way they wrap any other [`Operation`].
    pub fn infinite_query_store_with<Q, Fetch>(
        &self,
        operation: Q,
        wrap: impl FnOnce(InfiniteQueryAdapter<Arc<Q>>) -> Fetch,
    ) -> InfiniteQueryStore<Q>
    where
        Q: InfiniteQueryOperation,
        Q::PageValue: Clone,
        Q::Failure: Clone,
        Fetch: Operation<Value = Q::PageValue, Failure = Q::Failure>,
    {
        let path = operation.path();
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();

        if let Some(entry) = state.entries.get(&path) {
            if entry.type_id == TypeId::of::<InfiniteQueryStore<Q>>() {
                if let Some(store) = entry.store.as_any().downcast_ref::<InfiniteQueryStore<Q>>() {
                    return store.clone();
                }
            }
            self.report_issue(ClientIssue::DuplicatePath { path: path.clone() });
            let operation = Arc::new(operation);
            let fetcher = wrap(InfiniteQueryAdapter(operation.clone()));
            return InfiniteQueryStore::with_fetcher(operation, fetcher, self.base_context());
        }

        let operation = Arc::new(operation);
        let fetcher = wrap(InfiniteQueryAdapter(operation.clone()));
        let store = InfiniteQueryStore::with_fetcher(operation, fetcher, self.base_context());
        state.entries.insert(
            path,
            StoreEntry {
                type_id: TypeId::of::<InfiniteQueryStore<Q>>(),
                store: Arc::new(store.clone()),
            },
        );
        store
    }

    /// A strongly-typed lookup that fails instead of creating a store, distinguishing "nothing at
    /// this path" from "something at this path, but not of the type the caller asked for."
    pub fn typed_store<Op>(&self, path: &Path) -> Result<Store<Op>, ClientError>
    where
        Op: Operation,
        Op::Value: Clone,
        Op::Failure: Clone,
    {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        let entry = state.entries.get(path).ok_or_else(|| ClientError::NoSuchStore {
            path: path.clone(),
        })?;
        let store = entry.store.as_any().downcast_ref::<Store<Op>>().cloned();
        drop(state);
        drop(guard);
        store.ok_or_else(|| {
            self.report_issue(ClientIssue::TypeMismatch { path: path.clone() });
            ClientError::WrongStoreType { path: path.clone() }
        })
    }

    /// Logs `issue` via `tracing::warn!` and, if this client's config installed one, also invokes
    /// the `IssueHandlerKey` hook. The hook is never a substitute for the log — both always fire.
    fn report_issue(&self, issue: ClientIssue) {
        tracing::warn!(?issue, "client issue");
        if let Some(handler) = &self.inner.config.issue_handler {
            handler(issue);
        }
    }

    /// Type-erased lookup: `None` if no store is registered at `path`.
    pub fn store_with_path(&self, path: &Path) -> Option<Arc<dyn AnyStore>> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.entries.get(path).map(|entry| entry.store.clone())
    }

    /// A snapshot of every registered store whose path has `prefix` as a prefix.
    pub fn stores_matching(&self, prefix: &Path) -> Vec<(Path, Arc<dyn AnyStore>)> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state
            .entries
            .iter()
            .filter(|(path, _)| prefix.is_prefix_of(path))
            .map(|(path, entry)| (path.clone(), entry.store.clone()))
            .collect()
    }

    /// Same as [`stores_matching`](Client::stores_matching), downcast to a concrete `Store<Op>`;
    /// entries whose path matches but whose concrete type doesn't are silently skipped (a type
    /// mismatch here is not reported as an error, per the core's error-handling policy).
    pub fn stores_matching_of<Op>(&self, prefix: &Path) -> Vec<(Path, Store<Op>)>
    where
        Op: Operation,
        Op::Value: Clone,
        Op::Failure: Clone,
    {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state
            .entries
            .iter()
            .filter(|(path, _)| prefix.is_prefix_of(path))
            .filter_map(|(path, entry)| {
                entry
                    .store
                    .as_any()
                    .downcast_ref::<Store<Op>>()
                    .map(|store| (path.clone(), store.clone()))
            })
            .collect()
    }

    /// Removes the entry at `path`, if any.
    pub fn clear_store(&self, path: &Path) {
        let guard = self.inner.state.lock();
        guard.borrow_mut().entries.remove(path);
    }

    /// Removes every entry whose path has `prefix` as a prefix.
    pub fn clear_stores_matching(&self, prefix: &Path) {
        let guard = self.inner.state.lock();
        guard
            .borrow_mut()
            .entries
            .retain(|path, _| !prefix.is_prefix_of(path));
    }

    /// Runs `body` with exclusive, atomic access to the registry restricted to entries whose path
    /// has `prefix` as a prefix. Uses a reentrant lock, so `body` may itself call other `Client`
    /// methods (including another `with_stores`) on the same thread without deadlocking.
    pub fn with_stores<R>(&self, prefix: &Path, body: impl FnOnce(&mut StoresView<'_>) -> R) -> R {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        let mut view = StoresView {
            entries: &mut state.entries,
            prefix: prefix.clone(),
            defaults: self.base_context(),
        };
        body(&mut view)
    }

    /// For each registered entry whose `EvictWhen` mask includes `pressure` and which currently
    /// has no subscribers, removes it. A store created again afterward at the same path starts
    /// cold. A no-op if this client's attached [`StoreCache`] reports that it never evicts (see
    /// [`StoreCache::evicts`]) — regardless of how this method was invoked.
    pub fn evict_at_pressure(&self, pressure: Pressure) {
        if !self.inner.evicts {
            return;
        }
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        state.entries.retain(|path, entry| {
            let evictable = entry.store.evictable_pressure().contains(pressure);
            let idle = entry.store.subscriber_count() == 0;
            if evictable && idle {
                tracing::debug!(?path, ?pressure, "evicting idle store under memory pressure");
                false
            } else {
                true
            }
        });
    }

    fn base_context(&self) -> Context {
        self.inner.config.to_context().with::<crate::context::ClientHandleKey>(Some(self.handle()))
    }
}

/// A weak back-reference to a [`Client`], carried in a run's [`Context`] so an operation body (or
/// a long-lived value derived from one) can reach back into the registry without keeping the
/// client alive on its own.
#[derive(Clone)]
pub struct ClientHandle(Weak<ClientInner>);

impl ClientHandle {
    /// Recovers a strong [`Client`] handle, or `None` if every strong reference has been dropped.
    pub fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(|inner| Client { inner })
    }
}

/// The mutable view handed to [`Client::with_stores`]'s body: lookup, insertion, and removal
/// scoped to entries under one path prefix, applied atomically within the enclosing lock.
pub struct StoresView<'a> {
    entries: &'a mut HashMap<Path, StoreEntry>,
    prefix: Path,
    defaults: Context,
}

impl<'a> StoresView<'a> {
    /// Type-erased lookup, restricted to entries under this view's prefix.
    pub fn get(&self, path: &Path) -> Option<Arc<dyn AnyStore>> {
        if !self.prefix.is_prefix_of(path) {
            return None;
        }
        self.entries.get(path).map(|entry| entry.store.clone())
    }

    /// Inserts `store`, keyed by its own path (which must fall under this view's prefix).
    pub fn insert<Op>(&mut self, store: Store<Op>)
    where
        Op: Operation,
        Op::Value: Clone,
        Op::Failure: Clone,
    {
        let path = store.path().clone();
        debug_assert!(
            self.prefix.is_prefix_of(&path),
            "inserted store's path must fall under this view's prefix"
        );
        self.entries.insert(
            path,
            StoreEntry {
                type_id: TypeId::of::<Store<Op>>(),
                store: Arc::new(store),
            },
        );
    }

    /// Looks up an existing store at `operation`'s path, or creates and inserts one seeded with
    /// the owning client's `ClientConfig` defaults.
    pub fn get_or_create<Op>(&mut self, operation: Op) -> Store<Op>
    where
        Op: Operation,
        Op::Value: Clone,
        Op::Failure: Clone,
    {
        let path = operation.path();
        if let Some(entry) = self.entries.get(&path) {
            if let Some(store) = entry.store.as_any().downcast_ref::<Store<Op>>() {
                return store.clone();
            }
        }
        let store = Store::with_base_context(operation, self.defaults.clone());
        self.entries.insert(
            path,
            StoreEntry {
                type_id: TypeId::of::<Store<Op>>(),
                store: Arc::new(store.clone()),
            },
        );
        store
    }

    /// Removes the entry at `path`.
    pub fn remove(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::Continuation;
    use crate::error::OperationError;
    use crate::operation::{QueryAdapter, QueryOperation};
    use async_trait::async_trait;

    struct Echo {
        path: Path,
        value: u32,
    }

    #[async_trait]
    impl QueryOperation for Echo {
        type Value = u32;
        type Failure = &'static str;

        fn path(&self) -> Path {
            self.path.clone()
        }

        async fn fetch(
            &self,
            _context: Context,
            _continuation: Continuation<u32, &'static str>,
        ) -> Result<u32, OperationError<&'static str>> {
            Ok(self.value)
        }
    }

    fn echo(segment: &'static str, value: u32) -> QueryAdapter<Echo> {
        QueryAdapter(Echo {
            path: Path::of(segment),
            value,
        })
    }

    #[tokio::test]
    async fn store_creates_once_and_reuses_on_subsequent_lookups() {
        let client = Client::without_cache();
        let a = client.store(echo("users", 1));
        let b = client.store(echo("users", 2));
        assert_eq!(a.state().value(), b.state().value());
        assert!(std::ptr::eq(a.path(), a.path()));
    }

    #[tokio::test]
    async fn stores_matching_returns_exactly_the_prefix_matches() {
        let client = Client::without_cache();
        client.store(QueryAdapter(Echo {
            path: Path::of("users").append(1u64),
            value: 1,
        }));
        client.store(QueryAdapter(Echo {
            path: Path::of("users").append(2u64),
            value: 2,
        }));
        client.store(QueryAdapter(Echo {
            path: Path::of("posts").append(1u64),
            value: 3,
        }));

        let matches = client.stores_matching(&Path::of("users"));
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|(path, _)| Path::of("users").is_prefix_of(path)));
    }

    #[tokio::test]
    async fn clear_stores_matching_removes_only_the_prefix() {
        let client = Client::without_cache();
        client.store(QueryAdapter(Echo {
            path: Path::of("users").append(1u64),
            value: 1,
        }));
        client.store(QueryAdapter(Echo {
            path: Path::of("posts").append(1u64),
            value: 2,
        }));

        client.clear_stores_matching(&Path::of("users"));
        assert!(client.store_with_path(&Path::of("users").append(1u64)).is_none());
        assert!(client.store_with_path(&Path::of("posts").append(1u64)).is_some());
    }

    #[tokio::test]
    async fn with_stores_mutates_atomically_and_reentrantly() {
        let client = Client::without_cache();
        client.with_stores(&Path::of("users"), |view| {
            let store = view.get_or_create(echo("ignored", 0));
            let _ = store;
            // A nested `with_stores` call on the same thread must not deadlock.
            client.with_stores(&Path::of("users"), |inner| {
                inner.remove(&Path::of("users"));
            });
        });
    }

    #[tokio::test]
    async fn duplicate_path_with_a_different_store_type_reports_an_issue() {
        use crate::cache::NoEvictionCache;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let config = ClientConfig {
            issue_handler: Some(Arc::new(move |issue| seen_clone.lock().push(issue))),
            ..Default::default()
        };
        let client = Client::new(Arc::new(NoEvictionCache), config);

        client.store(echo("shared-path", 1));

        struct OtherEcho(u32);
        #[async_trait]
        impl QueryOperation for OtherEcho {
            type Value = u32;
            type Failure = &'static str;

            fn path(&self) -> Path {
                Path::of("shared-path")
            }

            async fn fetch(
                &self,
                _context: Context,
                _continuation: Continuation<u32, &'static str>,
            ) -> Result<u32, OperationError<&'static str>> {
                Ok(self.0)
            }
        }
        client.store(QueryAdapter(OtherEcho(2)));

        assert_eq!(seen.lock().len(), 1);
        assert!(matches!(seen.lock()[0], ClientIssue::DuplicatePath { .. }));
    }

    #[tokio::test]
    async fn typed_store_distinguishes_missing_from_wrong_type() {
        let client = Client::without_cache();
        let path = Path::of("users").append(1u64);
        let err = client.typed_store::<QueryAdapter<Echo>>(&path).unwrap_err();
        assert!(matches!(err, ClientError::NoSuchStore { .. }));

        client.store(QueryAdapter(Echo {
            path: path.clone(),
            value: 1,
        }));
        assert!(client.typed_store::<QueryAdapter<Echo>>(&path).is_ok());
    }

    #[tokio::test]
    async fn infinite_query_store_creates_once_and_reuses_on_subsequent_lookups() {
        use crate::operation::InfiniteQueryOperation;
        use crate::state::Page;

        struct Paged;

        #[async_trait]
        impl InfiniteQueryOperation for Paged {
            type PageId = u32;
            type PageValue = u32;
            type Failure = &'static str;

            fn path(&self) -> Path {
                Path::of("paged")
            }

            fn initial_page_id(&self) -> u32 {
                0
            }

            fn next_page_id(&self, last: Page<&u32, &u32>) -> Option<u32> {
                Some(*last.id + 1)
            }

            fn previous_page_id(&self, first: Page<&u32, &u32>) -> Option<u32> {
                if *first.id > 0 {
                    Some(*first.id - 1)
                } else {
                    None
                }
            }

            async fn fetch_page(
                &self,
                page_id: u32,
                _context: Context,
                _continuation: Continuation<u32, &'static str>,
            ) -> Result<u32, OperationError<&'static str>> {
                Ok(page_id)
            }
        }

        let client = Client::without_cache();
        let a = client.infinite_query_store(Paged);
        let b = client.infinite_query_store(Paged);
        assert!(std::ptr::eq(a.path(), a.path()));
        let _ = b;
    }
}
