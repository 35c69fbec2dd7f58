//! The user-implemented unit of work a [`Store`](crate::store::Store) drives.
//!
//! Three specializations — query, mutation, infinite query — all reduce to the same
//! [`Operation::run`] entry point. Each specialization gets its own marker trait with the
//! signature that specialization's authors actually want to implement, plus a named adapter
//! struct providing the one blanket-looking `impl Operation`. Giving `QueryOperation`,
//! `MutationOperation`, and `InfiniteQueryOperation` each their own blanket
//! `impl<T: Trait> Operation for T` would overlap in the compiler's eyes (it cannot prove the
//! three marker traits are mutually exclusive), so each gets a distinct wrapper type instead.

use std::marker::PhantomData;

use async_trait::async_trait;

use crate::context::{Context, ContextKey};
use crate::continuation::Continuation;
use crate::error::OperationError;
use crate::path::Path;
use crate::state::Page;

/// The single entry point every store drives, regardless of specialization.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;
    type Failure: Send + Sync + 'static;

    /// This operation's identity in a [`Client`](crate::client::Client)'s registry.
    fn path(&self) -> Path;

    /// Installs this operation's ambient context overrides (automatic-running specification,
    /// connection requirement, eviction mask, ...) once, when a [`Store`](crate::store::Store) is
    /// first created for it. Context-updating modifiers (`EnableAutomaticRunning`, `EvictWhen`,
    /// ...) override this and delegate to the wrapped operation; the default does nothing.
    fn setup(&self, _context: &mut Context) {}

    /// Runs to completion (or cancellation), optionally publishing intermediate results through
    /// `continuation` before returning its final outcome.
    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>>;
}

/// A query: fetches a value with no caller-supplied arguments beyond its own configuration.
#[async_trait]
pub trait QueryOperation: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;
    type Failure: Send + Sync + 'static;

    fn path(&self) -> Path;

    /// See [`Operation::setup`].
    fn setup(&self, _context: &mut Context) {}

    async fn fetch(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>>;
}

/// Wraps a [`QueryOperation`] as an [`Operation`].
pub struct QueryAdapter<Q>(pub Q);

#[async_trait]
impl<Q: QueryOperation> Operation for QueryAdapter<Q> {
    type Value = Q::Value;
    type Failure = Q::Failure;

    fn path(&self) -> Path {
        self.0.path()
    }

    fn setup(&self, context: &mut Context) {
        self.0.setup(context)
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        self.0.fetch(context, continuation).await
    }
}

/// The per-call argument context key a [`MutationAdapter`] reads its input from. Parameterized by
/// the concrete argument type so distinct mutations never collide in a shared `Context`.
pub struct ArgumentsKey<A>(PhantomData<A>);

impl<A: Clone + Send + Sync + 'static> ContextKey for ArgumentsKey<A> {
    type Value = Option<A>;

    fn default_value() -> Self::Value {
        None
    }
}

/// A mutation: performs a side effect given caller-supplied arguments, once per call rather than
/// being re-run automatically.
#[async_trait]
pub trait MutationOperation: Send + Sync + 'static {
    type Arguments: Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;
    type Failure: Send + Sync + 'static;

    fn path(&self) -> Path;

    /// See [`Operation::setup`].
    fn setup(&self, _context: &mut Context) {}

    async fn mutate(
        &self,
        arguments: Self::Arguments,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>>;
}

/// Wraps a [`MutationOperation`] as an [`Operation`]. The arguments for a given run travel through
/// that run's `Context` under [`ArgumentsKey`], set by
/// [`Store::mutate`](crate::store::Store::mutate) before the task is spawned.
pub struct MutationAdapter<M>(pub M);

#[async_trait]
impl<M: MutationOperation> Operation for MutationAdapter<M> {
    type Value = M::Value;
    type Failure = M::Failure;

    fn path(&self) -> Path {
        self.0.path()
    }

    fn setup(&self, context: &mut Context) {
        self.0.setup(context)
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        let arguments = context
            .get::<ArgumentsKey<M::Arguments>>()
            .expect("mutation run started without arguments bound in its context");
        self.0.mutate(arguments, context, continuation).await
    }
}

/// The per-run page-id context key an [`InfiniteQueryAdapter`] reads its target page from.
pub struct PageIdKey<Id>(PhantomData<Id>);

impl<Id: Clone + Send + Sync + 'static> ContextKey for PageIdKey<Id> {
    type Value = Option<Id>;

    fn default_value() -> Self::Value {
        None
    }
}

/// A paginated query: fetches one page at a time, in either direction, and exposes how to
/// determine the next/previous page id from the pages already fetched.
#[async_trait]
pub trait InfiniteQueryOperation: Send + Sync + 'static {
    type PageId: Eq + std::hash::Hash + Clone + Send + Sync + 'static;
    type PageValue: Clone + Send + Sync + 'static;
    type Failure: Send + Sync + 'static;

    fn path(&self) -> Path;

    /// See [`Operation::setup`].
    fn setup(&self, _context: &mut Context) {}

    /// The id of the first page to fetch when no pages have been loaded yet.
    fn initial_page_id(&self) -> Self::PageId;

    /// The id of the page after `last`, or `None` if `last` is known to be the final page.
    fn next_page_id(
        &self,
        last: Page<&Self::PageId, &Self::PageValue>,
    ) -> Option<Self::PageId>;

    /// The id of the page before `first`, or `None` if `first` is known to be the first page.
    fn previous_page_id(
        &self,
        first: Page<&Self::PageId, &Self::PageValue>,
    ) -> Option<Self::PageId>;

    async fn fetch_page(
        &self,
        page_id: Self::PageId,
        context: Context,
        continuation: Continuation<Self::PageValue, Self::Failure>,
    ) -> Result<Self::PageValue, OperationError<Self::Failure>>;
}

/// Forwards through the `Arc`, so an [`InfiniteQueryStore`](crate::infinite_store::InfiniteQueryStore)
/// can share one `Arc<Q>` between its own boundary computations and an [`InfiniteQueryAdapter`]
/// wrapped in modifiers for actually dispatching a fetch.
#[async_trait]
impl<Q: InfiniteQueryOperation> InfiniteQueryOperation for std::sync::Arc<Q> {
    type PageId = Q::PageId;
    type PageValue = Q::PageValue;
    type Failure = Q::Failure;

    fn path(&self) -> Path {
        (**self).path()
    }

    fn setup(&self, context: &mut Context) {
        (**self).setup(context)
    }

    fn initial_page_id(&self) -> Self::PageId {
        (**self).initial_page_id()
    }

    fn next_page_id(&self, last: Page<&Self::PageId, &Self::PageValue>) -> Option<Self::PageId> {
        (**self).next_page_id(last)
    }

    fn previous_page_id(&self, first: Page<&Self::PageId, &Self::PageValue>) -> Option<Self::PageId> {
        (**self).previous_page_id(first)
    }

    async fn fetch_page(
        &self,
        page_id: Self::PageId,
        context: Context,
        continuation: Continuation<Self::PageValue, Self::Failure>,
    ) -> Result<Self::PageValue, OperationError<Self::Failure>> {
        (**self).fetch_page(page_id, context, continuation).await
    }
}

/// Wraps an [`InfiniteQueryOperation`] as an [`Operation`] whose `Value` is a single page. A run
/// targets the page id bound in its `Context` under [`PageIdKey`] (falling back to
/// [`InfiniteQueryOperation::initial_page_id`] when unset), and the owning
/// [`InfiniteQueryStore`](crate::infinite_store::InfiniteQueryStore) is responsible for merging
/// each completed page into the observable [`PageSequence`].
pub struct InfiniteQueryAdapter<Q>(pub Q);

#[async_trait]
impl<Q: InfiniteQueryOperation> Operation for InfiniteQueryAdapter<Q> {
    type Value = Q::PageValue;
    type Failure = Q::Failure;

    fn path(&self) -> Path {
        self.0.path()
    }

    fn setup(&self, context: &mut Context) {
        self.0.setup(context)
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        let page_id = context
            .get::<PageIdKey<Q::PageId>>()
            .unwrap_or_else(|| self.0.initial_page_id());
        self.0.fetch_page(page_id, context, continuation).await
    }
}
