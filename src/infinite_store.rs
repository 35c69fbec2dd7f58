//! Observable store for paginated ("infinite") queries: fetches one page at a time, in either
//! direction, and merges it into an accumulated, ordered, unique-by-id [`InfiniteValue`].
//!
//! Kept as its own type rather than another [`Operation`](crate::operation::Operation) driven
//! through [`Store`](crate::store::Store): merging a fetched page into the right end of the
//! sequence needs the previous boundary page's id and value, which the generic `Operation::run`
//! signature has no way to see (it only gets a fresh `Context` and a `Continuation`). This store
//! computes that boundary itself, under its own lock, immediately before dispatching the fetch.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::{CancellationTokenKey, Clock, ClockKey, Context, ResultUpdateReason};
use crate::continuation::Continuation;
use crate::error::OperationError;
use crate::observer::PressureMask;
use crate::operation::{InfiniteQueryAdapter, InfiniteQueryOperation, Operation, PageIdKey};
use crate::path::Path;
use crate::state::{InfiniteValue, OperationState, Page, TaskDescriptor};
use crate::store::AnyStore;
use crate::subscription::Subscription;
use crate::task::{Task, TaskHandle, TaskId};

/// The observable state an [`InfiniteQueryStore`] maintains: its fetched-so-far pages plus
/// whether either direction is known to have more.
pub type InfiniteState<Q> = OperationState<
    InfiniteValue<<Q as InfiniteQueryOperation>::PageId, <Q as InfiniteQueryOperation>::PageValue>,
    <Q as InfiniteQueryOperation>::Failure,
>;

type ChangeCallback<Q> = Box<dyn Fn(&InfiniteState<Q>) + Send + Sync>;

struct Subscriber<Q: InfiniteQueryOperation> {
    id: u64,
    callback: ChangeCallback<Q>,
}

/// Which end of the page sequence a fetch extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

struct Inner<Q: InfiniteQueryOperation> {
    path: Path,
    state: Mutex<InfiniteState<Q>>,
    herd: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<Q>>>,
    subscriber_count: AtomicUsize,
    next_subscriber_id: AtomicU64,
    active_handles: Mutex<Vec<TaskHandle>>,
}

impl<Q> Inner<Q>
where
    Q: InfiniteQueryOperation,
    Q::PageValue: Clone,
    Q::Failure: Clone,
{
    fn snapshot(&self) -> InfiniteState<Q> {
        self.state.lock().clone()
    }

    /// Snapshot-under-lock, notify-after-release — the same discipline
    /// [`Store`](crate::store::Store) uses, so a reentrant subscriber callback can never deadlock
    /// against the update it is reacting to.
    fn notify(&self) {
        let snapshot = self.snapshot();
        for subscriber in self.subscribers.lock().iter() {
            (subscriber.callback)(&snapshot);
        }
    }

    fn current_herd(&self) -> u64 {
        self.herd.load(Ordering::SeqCst)
    }
}

/// A per-operation store for an [`InfiniteQueryOperation`]: `fetch_next_page` and
/// `fetch_previous_page` each dispatch exactly one page fetch and merge its result into the
/// accumulated [`InfiniteValue`], the same way [`Store::run`](crate::store::Store::run) dispatches
/// one run of a plain query.
pub struct InfiniteQueryStore<Q: InfiniteQueryOperation> {
    operation: Arc<Q>,
    /// Dispatches one page fetch. Defaults to a bare [`InfiniteQueryAdapter`] over `operation`,
    /// but may be any modifier stack (`Retry`, `Dedup`, `Suspend`, `LogDuration`, ...) built on
    /// top of one, via [`with_fetcher`](Self::with_fetcher) — the same composition a plain
    /// [`Store`](crate::store::Store) gets by wrapping its `Operation` before construction.
    fetcher: Arc<dyn Operation<Value = Q::PageValue, Failure = Q::Failure>>,
    inner: Arc<Inner<Q>>,
    base_context: Context,
}

impl<Q: InfiniteQueryOperation> Clone for InfiniteQueryStore<Q> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            fetcher: self.fetcher.clone(),
            inner: self.inner.clone(),
            base_context: self.base_context.clone(),
        }
    }
}

impl<Q> InfiniteQueryStore<Q>
where
    Q: InfiniteQueryOperation,
    Q::PageValue: Clone,
    Q::Failure: Clone,
{
    pub fn new(operation: Q) -> Self {
        Self::with_base_context(operation, Context::new())
    }

    /// Builds a store whose context template starts from `defaults` (typically a
    /// [`Client`](crate::client::Client)'s [`ClientConfig`](crate::client::ClientConfig)
    /// overrides) before the operation's own [`InfiniteQueryOperation::setup`] is layered on top.
    /// Dispatches fetches through a bare, unwrapped [`InfiniteQueryAdapter`]; use
    /// [`with_fetcher`](Self::with_fetcher) to wrap the fetch in modifiers.
    pub fn with_base_context(operation: Q, defaults: Context) -> Self {
        let operation = Arc::new(operation);
        let fetcher = InfiniteQueryAdapter(operation.clone());
        Self::with_fetcher(operation, fetcher, defaults)
    }

    /// Builds a store whose page fetch is dispatched through `fetcher` instead of a bare
    /// [`InfiniteQueryAdapter`], so callers can apply the same modifiers a plain query gets —
    /// `Retry::new(Dedup::keyed(InfiniteQueryAdapter(operation.clone()), |ctx| ctx.get::<PageIdKey<Q::PageId>>()), 3)`,
    /// for instance, retries and deduplicates per requested page. `operation` and `fetcher`
    /// typically share the same underlying value (see [`with_base_context`](Self::with_base_context)),
    /// but nothing requires it.
    pub fn with_fetcher<Fetch>(operation: Arc<Q>, fetcher: Fetch, mut defaults: Context) -> Self
    where
        Fetch: Operation<Value = Q::PageValue, Failure = Q::Failure>,
    {
        let path = operation.path();
        operation.setup(&mut defaults);
        Self {
            operation,
            fetcher: Arc::new(fetcher),
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(OperationState::new()),
                herd: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                subscriber_count: AtomicUsize::new(0),
                next_subscriber_id: AtomicU64::new(0),
                active_handles: Mutex::new(Vec::new()),
            }),
            base_context: defaults,
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn base_context(&self) -> Context {
        self.base_context.clone()
    }

    pub fn state(&self) -> InfiniteState<Q> {
        self.inner.snapshot()
    }

    /// `true` until the first page has ever been fetched.
    pub fn is_stale(&self) -> bool {
        self.state().value().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count.load(Ordering::SeqCst)
    }

    /// Registers `on_change`, invoking it once immediately with the current snapshot and then
    /// again after every subsequent state update. If this is the first subscriber and the store
    /// is both stale and automatic running is enabled, a `fetch_next_page` is scheduled
    /// immediately (which, on an empty store, fetches [`InfiniteQueryOperation::initial_page_id`]).
    pub fn subscribe(
        &self,
        on_change: impl Fn(&InfiniteState<Q>) + Send + Sync + 'static,
    ) -> Subscription {
        on_change(&self.state());
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            callback: Box::new(on_change),
        });
        let was_first = self.inner.subscriber_count.fetch_add(1, Ordering::SeqCst) == 0;

        if was_first
            && self.is_stale()
            && self
                .base_context
                .get::<crate::context::AutomaticRunningSpecificationKey>()
                .is_satisfied()
        {
            self.run_next_page(Context::new());
        }

        let inner = self.inner.clone();
        Subscription::new(move || {
            inner.subscribers.lock().retain(|s| s.id != id);
            inner.subscriber_count.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Clears the accumulated pages and invalidates every in-flight fetch: each is cancelled, and
    /// any result that lands afterward is silently dropped, since the herd it started under no
    /// longer matches.
    pub fn reset(&self) {
        let herd = self.inner.herd.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(path = ?self.inner.path, herd, "resetting infinite query store");
        for handle in self.inner.active_handles.lock().drain(..) {
            handle.cancel();
        }
        {
            let mut state = self.inner.state.lock();
            state.reset();
        }
        self.inner.notify();
    }

    /// The page id a fetch in `direction` would target, or `None` if that direction is exhausted
    /// (or, for `Previous` on an empty store, meaningless).
    fn target_page_id(&self, direction: Direction) -> Option<Q::PageId> {
        let state = self.inner.state.lock();
        match (direction, state.value()) {
            (Direction::Next, None) => Some(self.operation.initial_page_id()),
            (Direction::Previous, None) => None,
            (Direction::Next, Some(current)) => {
                if !current.has_next_page {
                    return None;
                }
                let id = current.pages.last_id()?;
                let value = current.pages.get(id)?;
                self.operation.next_page_id(Page { id, value })
            }
            (Direction::Previous, Some(current)) => {
                if !current.has_previous_page {
                    return None;
                }
                let id = current.pages.first_id()?;
                let value = current.pages.get(id)?;
                self.operation.previous_page_id(Page { id, value })
            }
        }
    }

    /// Dispatches one page fetch in `direction`, returning its handle without waiting for the
    /// outcome. Returns `None` without starting anything if that direction is already known to be
    /// exhausted.
    pub fn run(&self, caller_context: Context, direction: Direction) -> Option<TaskHandle> {
        let task = self.spawn_fetch(caller_context, direction)?;
        let handle = task.handle();
        tokio::spawn(async move {
            let _ = task.join().await;
        });
        Some(handle)
    }

    pub fn run_next_page(&self, caller_context: Context) -> Option<TaskHandle> {
        self.run(caller_context, Direction::Next)
    }

    pub fn run_previous_page(&self, caller_context: Context) -> Option<TaskHandle> {
        self.run(caller_context, Direction::Previous)
    }

    /// Fetches and merges the next page, awaiting the merged [`InfiniteValue`]. Returns `None`
    /// without fetching if the next direction is already exhausted.
    pub async fn fetch_next_page(
        &self,
        caller_context: Context,
    ) -> Option<Result<InfiniteValue<Q::PageId, Q::PageValue>, OperationError<Q::Failure>>> {
        let task = self.spawn_fetch(caller_context, Direction::Next)?;
        Some(task.join().await.unwrap_or(Err(OperationError::Cancelled)))
    }

    /// Fetches and merges the previous page. See [`fetch_next_page`](Self::fetch_next_page).
    pub async fn fetch_previous_page(
        &self,
        caller_context: Context,
    ) -> Option<Result<InfiniteValue<Q::PageId, Q::PageValue>, OperationError<Q::Failure>>> {
        let task = self.spawn_fetch(caller_context, Direction::Previous)?;
        Some(task.join().await.unwrap_or(Err(OperationError::Cancelled)))
    }

    fn spawn_fetch(
        &self,
        caller_context: Context,
        direction: Direction,
    ) -> Option<Task<Result<InfiniteValue<Q::PageId, Q::PageValue>, OperationError<Q::Failure>>>> {
        let page_id = self.target_page_id(direction)?;
        let herd = self.inner.current_herd();
        let task_id = TaskId::next();
        let operation = self.operation.clone();
        let fetcher = self.fetcher.clone();
        let inner = self.inner.clone();
        let cancellation = tokio_util::sync::CancellationToken::new();
        let context = self
            .base_context
            .merged_with(&caller_context)
            .with::<CancellationTokenKey>(cancellation.clone())
            .with::<PageIdKey<Q::PageId>>(Some(page_id.clone()));
        let clock = context.get::<ClockKey>();

        let task = Task::spawn_with_id(task_id, context.clone(), {
            let clock = clock.clone();
            let page_id = page_id.clone();
            async move {
                // No sink backs this continuation: a mid-page yield has nowhere meaningful to
                // merge into until the fetch completes and the boundary page id is known, so
                // intermediate yields from `fetch_page` are intentionally dropped here.
                let sink: Weak<dyn crate::continuation::ResultSink<Q::PageValue, Q::Failure>> =
                    Weak::new();
                let continuation = Continuation::new(sink, task_id, herd);
                let page_result = fetcher.run(context, continuation).await;

                let merged = if herd == inner.current_herd() {
                    let mut state = inner.state.lock();
                    let merged = match page_result {
                        Ok(page_value) => {
                            let mut current =
                                state.value().cloned().unwrap_or_else(InfiniteValue::new);
                            merge_page(&operation, &mut current, direction, page_id.clone(), page_value.clone());
                            state.apply_result(
                                ResultUpdateReason::ReturnedFinal,
                                Ok(current.clone()),
                                clock.now(),
                            );
                            Ok(current)
                        }
                        Err(error) => {
                            state.apply_result(
                                ResultUpdateReason::ReturnedFinal,
                                Err(error.clone()),
                                clock.now(),
                            );
                            Err(error)
                        }
                    };
                    state.end_task(task_id);
                    drop(state);
                    inner.notify();
                    merged
                } else {
                    tracing::debug!(
                        ?task_id,
                        herd,
                        current_herd = inner.current_herd(),
                        "dropping stale page fetch after reset"
                    );
                    page_result.map(|_| InfiniteValue::new())
                };
                inner.active_handles.lock().retain(|h| h.id() != task_id);
                merged
            }
        });

        let handle = task.handle();
        self.inner.active_handles.lock().push(handle.clone());
        {
            let mut state = self.inner.state.lock();
            state.begin_task(TaskDescriptor {
                id: handle.id(),
                started_at: clock.now(),
            });
        }
        self.inner.notify();
        Some(task)
    }
}

/// Merges one freshly-fetched page into `current`, updating which directions are still known to
/// have more. When `current` had no pages yet, both directions are derived from this single page
/// regardless of which direction the caller requested — a store's very first fetch establishes
/// both boundaries at once.
fn merge_page<Q>(
    operation: &Q,
    current: &mut InfiniteValue<Q::PageId, Q::PageValue>,
    direction: Direction,
    page_id: Q::PageId,
    page_value: Q::PageValue,
) where
    Q: InfiniteQueryOperation,
{
    let was_empty = current.pages.is_empty();
    match direction {
        Direction::Next => current.pages.push_back(page_id.clone(), page_value.clone()),
        Direction::Previous => current.pages.push_front(page_id.clone(), page_value.clone()),
    }

    let has_more_in = |dir: Direction| -> bool {
        match dir {
            Direction::Next => operation
                .next_page_id(Page {
                    id: &page_id,
                    value: &page_value,
                })
                .is_some(),
            Direction::Previous => operation
                .previous_page_id(Page {
                    id: &page_id,
                    value: &page_value,
                })
                .is_some(),
        }
    };

    if was_empty {
        current.has_next_page = has_more_in(Direction::Next);
        current.has_previous_page = has_more_in(Direction::Previous);
    } else {
        match direction {
            Direction::Next => current.has_next_page = has_more_in(Direction::Next),
            Direction::Previous => current.has_previous_page = has_more_in(Direction::Previous),
        }
    }
}

/// A type-erased view of an [`InfiniteQueryStore`], so a [`Client`](crate::client::Client) can
/// hold it in the same heterogeneous registry as plain [`Store`](crate::store::Store)s.
impl<Q> AnyStore for InfiniteQueryStore<Q>
where
    Q: InfiniteQueryOperation,
    Q::PageValue: Clone,
    Q::Failure: Clone,
{
    fn path(&self) -> &Path {
        InfiniteQueryStore::path(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn reset(&self) {
        InfiniteQueryStore::reset(self)
    }

    fn subscriber_count(&self) -> usize {
        InfiniteQueryStore::subscriber_count(self)
    }

    fn evictable_pressure(&self) -> PressureMask {
        self.base_context.get::<crate::context::EvictablePressureKey>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Paged {
        total_pages: u32,
    }

    #[async_trait]
    impl InfiniteQueryOperation for Paged {
        type PageId = u32;
        type PageValue = Vec<u32>;
        type Failure = &'static str;

        fn path(&self) -> Path {
            Path::of("paged")
        }

        fn initial_page_id(&self) -> u32 {
            0
        }

        fn next_page_id(&self, last: Page<&u32, &Vec<u32>>) -> Option<u32> {
            if *last.id + 1 < self.total_pages {
                Some(*last.id + 1)
            } else {
                None
            }
        }

        fn previous_page_id(&self, first: Page<&u32, &Vec<u32>>) -> Option<u32> {
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
            _continuation: Continuation<Vec<u32>, &'static str>,
        ) -> Result<Vec<u32>, OperationError<&'static str>> {
            Ok(vec![page_id * 10, page_id * 10 + 1])
        }
    }

    #[tokio::test]
    async fn fetch_next_page_establishes_both_boundaries_from_the_first_page() {
        let store = InfiniteQueryStore::new(Paged { total_pages: 3 });
        let value = store.fetch_next_page(Context::new()).await.unwrap().unwrap();
        assert_eq!(value.pages.len(), 1);
        assert!(value.has_next_page);
        assert!(!value.has_previous_page);
    }

    #[tokio::test]
    async fn fetch_next_page_appends_in_order_and_tracks_exhaustion() {
        let store = InfiniteQueryStore::new(Paged { total_pages: 2 });
        store.fetch_next_page(Context::new()).await.unwrap().unwrap();
        let value = store.fetch_next_page(Context::new()).await.unwrap().unwrap();
        assert_eq!(value.pages.first_id(), Some(&0));
        assert_eq!(value.pages.last_id(), Some(&1));
        assert!(!value.has_next_page);

        assert!(store.fetch_next_page(Context::new()).await.is_none());
    }

    #[tokio::test]
    async fn fetch_previous_page_prepends() {
        let store = InfiniteQueryStore::new(Paged { total_pages: 5 });
        // Seed at page 2 by driving a previous fetch from nowhere isn't meaningful; start at the
        // initial page, then walk forward, then back to the front boundary via fetch_previous.
        store.fetch_next_page(Context::new()).await.unwrap().unwrap(); // page 0
        assert!(store.fetch_previous_page(Context::new()).await.is_none());
    }

    #[tokio::test]
    async fn reset_drops_a_stale_in_flight_fetch() {
        let store = InfiniteQueryStore::new(Paged { total_pages: 3 });
        store.run_next_page(Context::new());
        store.reset();
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert!(store.state().value().is_none());
    }

    #[tokio::test]
    async fn subscribe_replays_the_current_snapshot_immediately() {
        let store = InfiniteQueryStore::new(Paged { total_pages: 3 });
        store.fetch_next_page(Context::new()).await.unwrap().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.subscribe(move |state| {
            seen_clone.lock().push(state.value().map(|v| v.pages.len()));
        });
        assert_eq!(seen.lock().as_slice(), &[Some(1)]);
    }

    #[tokio::test]
    async fn first_subscriber_triggers_an_automatic_initial_fetch() {
        let store = InfiniteQueryStore::new(Paged { total_pages: 3 });
        let _sub = store.subscribe(|_| {});
        for _ in 0..100 {
            if store.state().value().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.state().value().unwrap().pages.len(), 1);
    }

    struct FlakyPaged {
        total_pages: u32,
        attempts: Arc<std::sync::atomic::AtomicU32>,
    }

    #[async_trait]
    impl InfiniteQueryOperation for FlakyPaged {
        type PageId = u32;
        type PageValue = Vec<u32>;
        type Failure = &'static str;

        fn path(&self) -> Path {
            Path::of("flaky-paged")
        }

        fn initial_page_id(&self) -> u32 {
            0
        }

        fn next_page_id(&self, last: Page<&u32, &Vec<u32>>) -> Option<u32> {
            if *last.id + 1 < self.total_pages {
                Some(*last.id + 1)
            } else {
                None
            }
        }

        fn previous_page_id(&self, first: Page<&u32, &Vec<u32>>) -> Option<u32> {
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
            _continuation: Continuation<Vec<u32>, &'static str>,
        ) -> Result<Vec<u32>, OperationError<&'static str>> {
            if self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(OperationError::Failed("flaky"))
            } else {
                Ok(vec![page_id])
            }
        }
    }

    /// A bare `InfiniteQueryAdapter` routes every fetch straight to `fetch_page`, with no way for
    /// a caller to wrap it in a modifier. `with_fetcher` closes that gap: the page fetch becomes
    /// an ordinary `Operation`, so `Retry`, `Dedup`, `Suspend`, and `LogDuration` all apply to it
    /// exactly as they would to a plain query.
    #[tokio::test]
    async fn with_fetcher_allows_wrapping_the_page_fetch_in_a_retry() {
        use crate::modifier::retry::Retry;
        use std::time::Duration;

        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let operation = Arc::new(FlakyPaged {
            total_pages: 2,
            attempts: attempts.clone(),
        });
        let fetcher = Retry::new(InfiniteQueryAdapter(operation.clone()), 3)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
            .with_jitter_factor(0.0);
        let store = InfiniteQueryStore::with_fetcher(operation, fetcher, Context::new());

        let value = store.fetch_next_page(Context::new()).await.unwrap().unwrap();
        assert_eq!(value.pages.len(), 1);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
