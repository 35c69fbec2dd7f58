//! Type-keyed, copy-on-write bag of ambient values threaded through an operation run.
//!
//! Cloning a [`Context`] is cheap (an `Arc` bump); the first write after a clone copies the
//! underlying map once, the way `Arc::make_mut` always does. This gives every task its own
//! logically-independent context without ever locking or deep-cloning on the read path.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::ClientHandle;
use crate::run_specification::RunSpecification;
use crate::store::AnyStore;
use crate::task::TaskId;

/// A typed key into a [`Context`]. The key type itself is never instantiated — it exists only to
/// carry `Value` and a default at the type level, the same role a phantom marker plays elsewhere.
pub trait ContextKey: 'static {
    /// The type of value stored under this key.
    type Value: Clone + Send + Sync + 'static;

    /// The value observed by a read before any `set` for this key.
    fn default_value() -> Self::Value;
}

type Entry = Arc<dyn Any + Send + Sync>;

/// A type-keyed, copy-on-write map threaded through every operation run.
#[derive(Clone)]
pub struct Context {
    values: Arc<HashMap<TypeId, Entry>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// An empty context; every key reads as its default.
    pub fn new() -> Self {
        Self {
            values: Arc::new(HashMap::new()),
        }
    }

    /// Reads the value stored for `K`, or `K::default_value()` if never set.
    pub fn get<K: ContextKey>(&self) -> K::Value {
        self.values
            .get(&TypeId::of::<K>())
            .and_then(|entry| entry.downcast_ref::<K::Value>())
            .cloned()
            .unwrap_or_else(K::default_value)
    }

    /// Replaces the value stored for `K` in place.
    pub fn set<K: ContextKey>(&mut self, value: K::Value) {
        let map = Arc::make_mut(&mut self.values);
        map.insert(TypeId::of::<K>(), Arc::new(value));
    }

    /// Returns a copy of this context with `K` set to `value`, leaving `self` untouched.
    pub fn with<K: ContextKey>(self, value: K::Value) -> Self {
        let mut copy = self;
        copy.set::<K>(value);
        copy
    }

    /// Overlays `other`'s explicitly-set entries onto a clone of `self`. Keys `other` never set
    /// keep `self`'s value (or the default). This is the `⊕` composition operator used to build
    /// a run's effective context: `store_context ⊕ caller_overrides ⊕ bookkeeping`.
    pub fn merged_with(&self, other: &Context) -> Self {
        let mut map = (*self.values).clone();
        for (key, value) in other.values.iter() {
            map.insert(*key, value.clone());
        }
        Self {
            values: Arc::new(map),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("entries", &self.values.len())
            .finish()
    }
}

/// A point in time, as milliseconds since the Unix epoch. Produced only by a [`Clock`]; never
/// read from `SystemTime::now()` directly outside the default clock, so tests can inject one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn epoch() -> Self {
        Timestamp(0)
    }
}

/// Source of "now" for `*_last_updated_at` bookkeeping. Injectable so tests never depend on
/// real wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The default `Clock`, backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Timestamp(millis as i64)
    }
}

/// Strategy that awaits a duration, honoring cooperative cancellation. Injectable so retry/backoff
/// and suspend-until-true waits never depend on real time in tests (see `tokio::time::pause`).
#[async_trait]
pub trait Delayer: Send + Sync {
    /// Waits for `duration`, or returns early if `cancel` is signalled first.
    async fn delay(&self, duration: Duration, cancel: &CancellationToken);
}

/// The default `Delayer`, backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDelayer;

#[async_trait]
impl Delayer for TokioDelayer {
    async fn delay(&self, duration: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// User-pluggable structured logging sink for operation results. Independent of the crate's own
/// internal `tracing` instrumentation (see [`crate::modifier::log_duration`]) — this key exists
/// for host applications that want to observe results through their own channel as well.
pub trait OperationLogger: Send + Sync {
    fn log(&self, level: tracing::Level, message: &str);
}

/// Distinguishes a [`Continuation`](crate::continuation::Continuation) yield from a task's final
/// return; both are routed through the same state-update method and differ only by this flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultUpdateReason {
    Yielded,
    ReturnedFinal,
}

// --- Well-known context keys (spec §4.2) ---------------------------------------------------

/// Source of "now" timestamps. Default: [`SystemClock`].
pub struct ClockKey;
impl ContextKey for ClockKey {
    type Value = Arc<dyn Clock>;
    fn default_value() -> Self::Value {
        Arc::new(SystemClock)
    }
}

/// Strategy for awaiting retry/backoff/suspend delays. Default: [`TokioDelayer`].
pub struct DelayerKey;
impl ContextKey for DelayerKey {
    type Value = Arc<dyn Delayer>;
    fn default_value() -> Self::Value {
        Arc::new(TokioDelayer)
    }
}

/// Hard cap on retry attempts regardless of a `Retry` modifier's configured limit.
pub struct MaxRetriesKey;
impl ContextKey for MaxRetriesKey {
    type Value = u32;
    fn default_value() -> Self::Value {
        u32::MAX
    }
}

/// The current attempt number (0-based), as visible to the inner operation body.
pub struct RetryIndexKey;
impl ContextKey for RetryIndexKey {
    type Value = u32;
    fn default_value() -> Self::Value {
        0
    }
}

/// Optional user-supplied logging sink for operation results. `None` by default; the crate's own
/// `tracing` call sites are unaffected by this key (see SPEC_FULL.md §10).
pub struct LoggerKey;
impl ContextKey for LoggerKey {
    type Value = Option<Arc<dyn OperationLogger>>;
    fn default_value() -> Self::Value {
        None
    }
}

/// Weak back-reference to the enclosing [`Client`](crate::client::Client), if the store was
/// created through one.
pub struct ClientHandleKey;
impl ContextKey for ClientHandleKey {
    type Value = Option<ClientHandle>;
    fn default_value() -> Self::Value {
        None
    }
}

/// Type-erased handle to the store that owns the currently-running task.
pub struct CurrentStoreKey;
impl ContextKey for CurrentStoreKey {
    type Value = Option<Arc<dyn AnyStore>>;
    fn default_value() -> Self::Value {
        None
    }
}

/// The id of the task currently executing, if any.
pub struct CurrentTaskIdKey;
impl ContextKey for CurrentTaskIdKey {
    type Value = Option<TaskId>;
    fn default_value() -> Self::Value {
        None
    }
}

/// The cancellation token for the task currently executing. A [`Store`](crate::store::Store) run
/// binds this to the real task's token before the body starts; `Suspend`'s wait and `Retry`'s
/// backoff delay both race against it so a cancelled task unwinds promptly instead of running to
/// completion. The default is a token that is never cancelled (outside a store-driven run).
pub struct CancellationTokenKey;
impl ContextKey for CancellationTokenKey {
    type Value = CancellationToken;
    fn default_value() -> Self::Value {
        CancellationToken::new()
    }
}

/// `Yielded` during a [`Continuation`](crate::continuation::Continuation) yield, `ReturnedFinal`
/// while applying a task's final outcome.
pub struct ResultUpdateReasonKey;
impl ContextKey for ResultUpdateReasonKey {
    type Value = ResultUpdateReason;
    fn default_value() -> Self::Value {
        ResultUpdateReason::ReturnedFinal
    }
}

/// Predicate gating automatic runs on first subscriber / staleness. Default: always satisfied.
pub struct AutomaticRunningSpecificationKey;
impl ContextKey for AutomaticRunningSpecificationKey {
    type Value = RunSpecification;
    fn default_value() -> Self::Value {
        RunSpecification::always(true)
    }
}

/// Minimum connectivity level required for `RunSpecification::connected` to report satisfied.
pub struct SatisfiedConnectionStatusKey;
impl ContextKey for SatisfiedConnectionStatusKey {
    type Value = crate::observer::ConnectionStatus;
    fn default_value() -> Self::Value {
        crate::observer::ConnectionStatus::RequiresConnection
    }
}

/// Bitmask of memory-pressure levels at which this store may be evicted from its cache.
pub struct EvictablePressureKey;
impl ContextKey for EvictablePressureKey {
    type Value = crate::observer::PressureMask;
    fn default_value() -> Self::Value {
        crate::observer::PressureMask::NONE
    }
}

/// Opt-out for automatic rerun when the application becomes active again.
pub struct IsAppActiveRerunEnabledKey;
impl ContextKey for IsAppActiveRerunEnabledKey {
    type Value = bool;
    fn default_value() -> Self::Value {
        true
    }
}

/// Optional sink for [`ClientIssue`](crate::error::ClientIssue)s, invoked alongside (never
/// instead of) the crate's own `tracing::warn!` at the same call site. `None` by default — a host
/// that wants these surfaced outside logs (a metrics counter, an in-app banner) installs one via
/// [`ClientConfig`](crate::client::ClientConfig).
pub struct IssueHandlerKey;
impl ContextKey for IssueHandlerKey {
    type Value = Option<Arc<dyn Fn(crate::error::ClientIssue) + Send + Sync>>;
    fn default_value() -> Self::Value {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RetryLimitKey;
    impl ContextKey for RetryLimitKey {
        type Value = u32;
        fn default_value() -> Self::Value {
            3
        }
    }

    #[test]
    fn unset_key_reads_its_default() {
        let ctx = Context::new();
        assert_eq!(ctx.get::<RetryLimitKey>(), 3);
    }

    #[test]
    fn set_replaces_the_stored_value() {
        let mut ctx = Context::new();
        ctx.set::<RetryLimitKey>(9);
        assert_eq!(ctx.get::<RetryLimitKey>(), 9);
    }

    #[test]
    fn with_returns_an_independent_copy() {
        let base = Context::new();
        let overridden = base.clone().with::<RetryLimitKey>(9);
        assert_eq!(base.get::<RetryLimitKey>(), 3);
        assert_eq!(overridden.get::<RetryLimitKey>(), 9);
    }

    #[test]
    fn merged_with_only_overlays_explicitly_set_keys() {
        let base = Context::new().with::<RetryLimitKey>(9);
        let overrides = Context::new(); // RetryLimitKey never set here
        let merged = base.merged_with(&overrides);
        assert_eq!(merged.get::<RetryLimitKey>(), 9);

        let overrides_again = Context::new().with::<RetryLimitKey>(1);
        let merged_again = base.merged_with(&overrides_again);
        assert_eq!(merged_again.get::<RetryLimitKey>(), 1);
    }

    #[test]
    fn well_known_keys_have_sensible_defaults() {
        let ctx = Context::new();
        assert_eq!(ctx.get::<MaxRetriesKey>(), u32::MAX);
        assert_eq!(ctx.get::<RetryIndexKey>(), 0);
        assert!(ctx.get::<LoggerKey>().is_none());
        assert!(ctx.get::<IsAppActiveRerunEnabledKey>());
    }
}
