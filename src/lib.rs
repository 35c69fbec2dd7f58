//! A client-side engine for durable, observable, deduplicated, retryable,
//! reactively-refreshable lifecycles of arbitrary async operations.
//!
//! Three pieces compose to form the public surface:
//!
//! - [`store`]: the per-operation [`Store`](store::Store), which owns one operation's observable
//!   [`OperationState`](state::OperationState), its active tasks, and the herd counter that lets a
//!   [`reset`](store::Store::reset) safely outrun an in-flight run.
//! - [`client`]: the process-wide, path-keyed [`Client`](client::Client) registry — pattern-match
//!   retrieval, atomic bulk mutation via [`with_stores`](client::Client::with_stores), and
//!   pluggable cache eviction via [`StoreCache`](cache::StoreCache).
//! - [`modifier`]: composable wrappers (`Retry`, `Dedup`, `Suspend`, `RerunOnChange`, ...) that
//!   inject production behavior around a user's [`Operation`](operation::Operation) body without
//!   it needing to know any of them exist.
//!
//! An operation body is written once against [`QueryOperation`](operation::QueryOperation),
//! [`MutationOperation`](operation::MutationOperation), or
//! [`InfiniteQueryOperation`](operation::InfiniteQueryOperation); everything else — retries,
//! deduplication, cancellation, observability — is layered on from the outside. A paginated
//! operation is driven through [`infinite_store::InfiniteQueryStore`] rather than `Store` directly
//! — merging a fetched page into the right end of the accumulated sequence needs the previous
//! boundary page, which the generic `Operation::run` signature has no way to see.

pub mod cache;
pub mod client;
pub mod context;
pub mod continuation;
pub mod error;
pub mod infinite_store;
pub mod modifier;
pub mod observer;
pub mod operation;
pub mod path;
pub mod run_specification;
pub mod state;
pub mod store;
pub mod subscription;
pub mod task;
pub mod test_support;

pub use cache::{NoEvictionCache, PressureEvictingCache, StoreCache};
pub use client::{Client, ClientConfig, ClientHandle, StoresView};
pub use context::{Clock, Context, ContextKey, Delayer, OperationLogger, SystemClock, Timestamp};
pub use continuation::{Continuation, ResultSink};
pub use error::{ClientError, ClientIssue, OperationError};
pub use infinite_store::{Direction, InfiniteQueryStore};
pub use modifier::{
    Dedup, DisableApplicationActiveRerunning, EnableAutomaticRunning, EvictWhen, LogDuration,
    RerunOnChange, Retry, SatisfiedConnectionStatus, Suspend,
};
pub use observer::{
    ApplicationActivityObserver, ConnectionStatus, MemoryPressureSource, NetworkObserver,
    Pressure, PressureMask,
};
pub use operation::{
    InfiniteQueryAdapter, InfiniteQueryOperation, MutationAdapter, MutationOperation, Operation,
    QueryAdapter, QueryOperation,
};
pub use path::{Path, PathElement};
pub use run_specification::{RunSpecification, RunSpecificationHandle};
pub use state::{InfiniteQueryState, InfiniteValue, OperationState, Page, PageSequence, Status, TaskDescriptor};
pub use store::{AnyStore, Store};
pub use subscription::Subscription;
pub use task::{Task, TaskHandle, TaskId};

/// Installs a `tracing_subscriber::fmt` subscriber at `DEBUG` for the duration of the process,
/// ignoring the error if one is already installed. A convenience for examples and integration
/// tests only — the crate's own call sites never depend on this being called; any
/// `tracing_subscriber::Layer` a host installs independently works just as well. Only available
/// with the default-on `logging` feature.
#[cfg(feature = "logging")]
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}
