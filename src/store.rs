//! The per-operation orchestrator: owns the observable state, the currently active tasks, and
//! the herd counter that lets a reset safely outrun an in-flight run.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{
    AutomaticRunningSpecificationKey, Clock, ClockKey, Context, CurrentStoreKey, CurrentTaskIdKey,
    ResultUpdateReason, CancellationTokenKey,
};
use crate::continuation::{Continuation, ResultSink};
use crate::error::OperationError;
use crate::modifier::RerunOnChange;
use crate::observer::PressureMask;
use crate::operation::{ArgumentsKey, MutationAdapter, MutationOperation, Operation};
use crate::path::Path;
use crate::state::{OperationState, TaskDescriptor};
use crate::subscription::Subscription;
use crate::task::{Task, TaskHandle, TaskId};

type ChangeCallback<V, F> = Box<dyn Fn(&OperationState<V, F>) + Send + Sync>;

struct Subscriber<V, F> {
    id: u64,
    callback: ChangeCallback<V, F>,
}

/// The guarded, shared state behind every [`Store`] handle. Kept separate from `Store` itself so
/// a [`Continuation`] can hold a `Weak` reference to exactly this and nothing more.
pub struct StoreInner<V, F> {
    path: Path,
    state: Mutex<OperationState<V, F>>,
    herd: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<V, F>>>,
    subscriber_count: AtomicUsize,
    next_subscriber_id: AtomicU64,
    /// Cancellation handles for every task currently contributing to this store's state, so a
    /// `reset` can signal them all rather than merely letting their eventual yields fall through
    /// the herd check unnoticed.
    active_handles: Mutex<Vec<TaskHandle>>,
}

impl<V, F> StoreInner<V, F>
where
    V: Clone + Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    fn snapshot(&self) -> OperationState<V, F>
    where
        V: Clone,
        F: Clone,
    {
        self.state.lock().clone()
    }

    /// Notifies subscribers with a snapshot taken after the lock that produced it has already
    /// been released, so a reentrant subscriber callback (one that itself calls back into this
    /// store) can never deadlock against the update it's reacting to.
    fn notify(&self)
    where
        V: Clone,
        F: Clone,
    {
        let snapshot = self.snapshot();
        for subscriber in self.subscribers.lock().iter() {
            (subscriber.callback)(&snapshot);
        }
    }

    fn current_herd(&self) -> u64 {
        self.herd.load(Ordering::SeqCst)
    }
}

impl<V, F> ResultSink<V, F> for StoreInner<V, F>
where
    V: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    fn yield_result(&self, task_id: TaskId, herd: u64, result: Result<V, OperationError<F>>) {
        if herd != self.current_herd() {
            // Superseded by a reset since this task began; drop the stale yield.
            return;
        }
        {
            let mut state = self.state.lock();
            state.apply_result(ResultUpdateReason::Yielded, result, system_now());
        }
        let _ = task_id;
        self.notify();
    }
}

// `Timestamp::epoch()` was a placeholder for yields before this module threaded a clock through
// `ResultSink`; yields now stamp with the wall-clock time same as a final return would, via the
// store's own default clock. Kept as a free function (rather than a method) since `StoreInner`
// doesn't carry a `Clock` of its own — only `Store` does, via its base context.
fn system_now() -> crate::context::Timestamp {
    crate::context::SystemClock.now()
}

/// A handle to one operation's store: its observable state, its active tasks, and the ability to
/// start a new run or reset everything back to idle.
///
/// Cloning a `Store` clones the handle, not the state — every clone observes and mutates the same
/// underlying [`StoreInner`].
pub struct Store<Op: Operation> {
    operation: Arc<Op>,
    inner: Arc<StoreInner<Op::Value, Op::Failure>>,
    /// The context template installed once via [`Operation::setup`], overlaid by each run's
    /// caller-provided context per the `store_context ⊕ caller_overrides ⊕ bookkeeping`
    /// composition order.
    base_context: Context,
}

impl<Op: Operation> Clone for Store<Op> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            inner: self.inner.clone(),
            base_context: self.base_context.clone(),
        }
    }
}

impl<Op: Operation> Store<Op>
where
    Op::Value: Clone,
    Op::Failure: Clone,
{
    pub fn new(operation: Op) -> Self {
        Self::with_base_context(operation, Context::new())
    }

    /// Builds a store whose context template starts from `defaults` (typically a
    /// [`Client`](crate::client::Client)'s [`ClientConfig`](crate::client::ClientConfig)
    /// overrides) before the operation's own [`Operation::setup`] is layered on top —
    /// `defaults ⊕ operation.setup`, per the store-context half of the run composition order.
    pub fn with_base_context(operation: Op, mut defaults: Context) -> Self {
        let path = operation.path();
        operation.setup(&mut defaults);
        Self {
            operation: Arc::new(operation),
            inner: Arc::new(StoreInner {
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

    /// The context template installed at construction via the operation's `setup`.
    pub fn base_context(&self) -> Context {
        self.base_context.clone()
    }

    /// A snapshot of the current observable state.
    pub fn state(&self) -> OperationState<Op::Value, Op::Failure> {
        self.inner.snapshot()
    }

    /// `true` once no run has ever produced a value — the default staleness predicate for a store
    /// that hasn't been given a custom one.
    pub fn is_stale(&self) -> bool {
        self.state().value().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count.load(Ordering::SeqCst)
    }

    /// Registers `on_change`, invoking it once immediately with the current state snapshot and
    /// then again after every subsequent state update. If this is the store's first subscriber
    /// and it is both stale and automatic running is enabled in its base context, a run is
    /// scheduled immediately, as if the caller had invoked [`run`](Store::run) themselves.
    pub fn subscribe(
        &self,
        on_change: impl Fn(&OperationState<Op::Value, Op::Failure>) + Send + Sync + 'static,
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
                .get::<AutomaticRunningSpecificationKey>()
                .is_satisfied()
        {
            self.run(Context::new());
        }

        let inner = self.inner.clone();
        Subscription::new(move || {
            inner.subscribers.lock().retain(|s| s.id != id);
            inner.subscriber_count.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Clears the observable value/error back to their initial state and invalidates every
    /// currently running task: each is cancelled, and any yield or final return that lands
    /// afterward is silently dropped, since the herd it was started under no longer matches.
    pub fn reset(&self) {
        let herd = self.inner.herd.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(path = ?self.inner.path, herd, "resetting store");
        for handle in self.inner.active_handles.lock().drain(..) {
            handle.cancel();
        }
        {
            let mut state = self.inner.state.lock();
            state.reset();
        }
        self.inner.notify();
    }

    /// Applies `result` directly, as if it had been produced by a task of the current generation
    /// — used to seed a store's value from outside the normal run machinery (for example, an
    /// optimistic update, or a value restored from an external source).
    pub fn set_result(&self, result: Result<Op::Value, OperationError<Op::Failure>>, context: Option<Context>) {
        let clock = context
            .unwrap_or_else(Context::new)
            .get::<ClockKey>();
        {
            let mut state = self.inner.state.lock();
            state.apply_result(ResultUpdateReason::ReturnedFinal, result, clock.now());
        }
        self.inner.notify();
    }

    fn effective_context(&self, caller_context: Context, task_id: TaskId, cancellation: tokio_util::sync::CancellationToken) -> Context {
        let self_handle: Arc<dyn AnyStore> = Arc::new(self.clone());
        self.base_context
            .merged_with(&caller_context)
            .with::<CurrentTaskIdKey>(Some(task_id))
            .with::<CancellationTokenKey>(cancellation)
            .with::<CurrentStoreKey>(Some(self_handle))
    }

    /// Builds and spawns the task for a run, returning it (not yet detached) so callers can
    /// either fire-and-forget it ([`run`](Store::run)) or await its outcome
    /// ([`run_and_await`](Store::run_and_await)).
    #[tracing::instrument(level = "debug", skip_all, fields(path = ?self.inner.path))]
    fn spawn_run(&self, caller_context: Context) -> Task<Result<Op::Value, OperationError<Op::Failure>>> {
        let herd = self.inner.current_herd();
        let task_id = TaskId::next();
        tracing::debug!(?task_id, herd, "starting run");
        let operation = self.operation.clone();
        let inner = self.inner.clone();
        let cancellation = tokio_util::sync::CancellationToken::new();
        let context = self.effective_context(caller_context, task_id, cancellation.clone());
        let clock = context.get::<ClockKey>();

        let sink: std::sync::Weak<dyn ResultSink<Op::Value, Op::Failure>> =
            Arc::downgrade(&inner) as _;

        let task = Task::spawn_with_id(task_id, context.clone(), {
            let inner = inner.clone();
            let clock = clock.clone();
            async move {
                let continuation = Continuation::new(sink, task_id, herd);
                let result = operation.run(context, continuation).await;
                if herd == inner.current_herd() {
                    let mut state = inner.state.lock();
                    state.apply_result(ResultUpdateReason::ReturnedFinal, clone_result(&result), clock.now());
                    state.end_task(task_id);
                    drop(state);
                    inner.notify();
                } else {
                    tracing::debug!(?task_id, herd, current_herd = inner.current_herd(), "dropping stale result after reset");
                }
                inner.active_handles.lock().retain(|h| h.id() != task_id);
                result
            }
        });

        let handle = task.handle();
        self.inner.active_handles.lock().push(handle.clone());
        {
            let mut state = inner.state.lock();
            state.begin_task(TaskDescriptor {
                id: handle.id(),
                started_at: clock.now(),
            });
        }
        inner.notify();
        task
    }

    /// Starts a new run of the wrapped operation against `caller_context`, returning a handle
    /// that can cancel it without waiting for its outcome. Every yield and the final return apply
    /// only if this store hasn't been reset since the run started — an in-flight task from before
    /// a reset can never resurrect stale state.
    pub fn run(&self, caller_context: Context) -> TaskHandle {
        let task = self.spawn_run(caller_context);
        let handle = task.handle();
        tokio::spawn(async move {
            let _ = task.join().await;
        });
        handle
    }

    /// Starts a new run and awaits its final outcome. A task cancelled before completing (for
    /// example by a concurrent `reset`) surfaces as `Err(OperationError::Cancelled)` here even if
    /// its own body returned a different error, since this caller's view of "this run" ends at
    /// cancellation.
    pub async fn run_and_await(
        &self,
        caller_context: Context,
    ) -> Result<Op::Value, OperationError<Op::Failure>> {
        let task = self.spawn_run(caller_context);
        task.join().await.unwrap_or(Err(OperationError::Cancelled))
    }

    /// Attaches a [`RerunOnChange`] controller: whenever `controller.specification` transitions
    /// false → true while this store has at least one subscriber, is stale, and automatic running
    /// is enabled, a fresh run is scheduled; a true → false transition cancels it if still
    /// in flight. Cancelling the returned subscription detaches the controller.
    pub fn attach_rerun_on_change(&self, controller: RerunOnChange) -> Subscription {
        let store = self.clone();
        let current_rerun: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));
        controller.specification.subscribe(move |satisfied| {
            if satisfied {
                let automatic_running_enabled = store
                    .base_context
                    .get::<AutomaticRunningSpecificationKey>()
                    .is_satisfied();
                if store.subscriber_count() > 0 && store.is_stale() && automatic_running_enabled {
                    let handle = store.run(Context::new());
                    *current_rerun.lock() = Some(handle);
                }
            } else if let Some(handle) = current_rerun.lock().take() {
                handle.cancel();
            }
        })
    }
}

impl<M: MutationOperation> Store<MutationAdapter<M>>
where
    M::Value: Clone,
    M::Failure: Clone,
{
    /// Starts a mutation run with `arguments` bound into the run's `Context` under
    /// [`ArgumentsKey`], awaiting its final outcome. This is the only way to drive a
    /// [`Store`] wrapping a [`MutationAdapter`], since [`run`](Store::run) and
    /// [`run_and_await`](Store::run_and_await) have no arguments to bind.
    pub async fn mutate(
        &self,
        arguments: M::Arguments,
    ) -> Result<M::Value, OperationError<M::Failure>> {
        let context = Context::new().with::<ArgumentsKey<M::Arguments>>(Some(arguments));
        self.run_and_await(context).await
    }
}

/// A type-erased view of a [`Store`], used by [`Client`](crate::client::Client) to hold stores of
/// heterogeneous `Operation` types in one registry.
pub trait AnyStore: Send + Sync + 'static {
    fn path(&self) -> &Path;
    fn as_any(&self) -> &dyn Any;
    /// Clears the store's value/error and invalidates its in-flight tasks.
    fn reset(&self);
    /// Number of live subscribers, used by a [`StoreCache`](crate::cache::StoreCache) to decide
    /// eviction eligibility.
    fn subscriber_count(&self) -> usize;
    /// The eviction pressure mask installed by this store's operation, via `EvictWhen`.
    fn evictable_pressure(&self) -> PressureMask;
}

impl<Op: Operation> AnyStore for Store<Op>
where
    Op::Value: Clone,
    Op::Failure: Clone,
{
    fn path(&self) -> &Path {
        Store::path(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn reset(&self) {
        Store::reset(self)
    }

    fn subscriber_count(&self) -> usize {
        Store::subscriber_count(self)
    }

    fn evictable_pressure(&self) -> PressureMask {
        self.base_context.get::<crate::context::EvictablePressureKey>()
    }
}

fn clone_result<V: Clone, F: Clone>(
    result: &Result<V, OperationError<F>>,
) -> Result<V, OperationError<F>> {
    result.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::QueryOperation;
    use crate::run_specification::RunSpecification;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    struct CountingQuery {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl QueryOperation for CountingQuery {
        type Value = u32;
        type Failure = &'static str;

        fn path(&self) -> Path {
            Path::of("counting")
        }

        async fn fetch(
            &self,
            _context: Context,
            _continuation: Continuation<u32, &'static str>,
        ) -> Result<u32, OperationError<&'static str>> {
            let n = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            Ok(n)
        }
    }

    #[tokio::test]
    async fn run_applies_the_final_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Store::new(crate::operation::QueryAdapter(CountingQuery {
            calls: calls.clone(),
        }));

        let handle = store.run(Context::new());
        for _ in 0..100 {
            if !store.state().is_running() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!handle.is_cancelled());
        assert_eq!(store.state().value(), Some(&1));
    }

    #[tokio::test]
    async fn run_and_await_returns_the_final_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Store::new(crate::operation::QueryAdapter(CountingQuery {
            calls: calls.clone(),
        }));
        let result = store.run_and_await(Context::new()).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_drops_a_stale_in_flight_yield() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Store::new(crate::operation::QueryAdapter(CountingQuery {
            calls: calls.clone(),
        }));

        store.run(Context::new());
        store.reset();
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        // The run from before `reset` may still complete, but its herd no longer matches, so it
        // must not resurrect a value into the freshly-reset state.
        assert!(store.state().value().is_none());
    }

    #[tokio::test]
    async fn subscribe_replays_the_current_snapshot_immediately() {
        let store = Store::new(crate::operation::QueryAdapter(CountingQuery {
            calls: Arc::new(AtomicU32::new(0)),
        }));
        store.set_result(Ok(7), None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.subscribe(move |state| {
            seen_clone.lock().push(state.value().copied());
        });
        assert_eq!(seen.lock().as_slice(), &[Some(7)]);
    }

    #[tokio::test]
    async fn subscribers_see_state_after_a_run_completes() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Store::new(crate::operation::QueryAdapter(CountingQuery {
            calls: calls.clone(),
        }));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.subscribe(move |state| {
            seen_clone.lock().push(state.value().copied());
        });

        store.run(Context::new());
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert!(seen.lock().contains(&Some(1)));
    }

    #[tokio::test]
    async fn first_subscriber_triggers_an_automatic_run_when_stale() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Store::new(crate::operation::QueryAdapter(CountingQuery {
            calls: calls.clone(),
        }));

        let _sub = store.subscribe(|_| {});
        for _ in 0..100 {
            if calls.load(AtomicOrdering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rerun_on_change_schedules_exactly_one_run_per_transition() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Store::new(crate::operation::QueryAdapter(CountingQuery {
            calls: calls.clone(),
        }));
        let (spec, handle) = RunSpecification::cell(false);
        let _controller = store.attach_rerun_on_change(RerunOnChange::new(spec));
        // A subscriber is required for the controller to consider this store eligible.
        let _sub = store.subscribe(|_| {});
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        let before = calls.load(AtomicOrdering::SeqCst);

        handle.set(true);
        for _ in 0..100 {
            if calls.load(AtomicOrdering::SeqCst) > before {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), before + 1);
    }
}
