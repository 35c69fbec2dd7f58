//! Collapses concurrent runs that share a deduplication key into a single in-flight execution.

use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::context::Context;
use crate::continuation::Continuation;
use crate::error::OperationError;
use crate::operation::Operation;
use crate::path::Path;

type SharedResult<V, F> = Result<V, OperationError<F>>;
type Receiver<V, F> = watch::Receiver<Option<SharedResult<V, F>>>;
type KeyFn<K> = Box<dyn Fn(&Context) -> K + Send + Sync>;

/// Wraps an [`Operation`] so that a run started while another run with an equal key is already in
/// flight attaches to that run instead of starting a second, redundant one; both callers observe
/// the same final result. Runs whose keys differ execute independently and concurrently.
///
/// The key is computed from each run's `Context` by `key_fn`. [`Dedup::new`] uses `()` as the key
/// for every run — the operation's own identity, since a `Dedup` already wraps one operation
/// instance — collapsing every concurrent run of it into a single slot. A paginated operation
/// instead keys by its requested page (e.g. reading `PageIdKey` out of the context passed to
/// `InfiniteQueryAdapter`), so concurrent fetches of distinct pages never collapse into each
/// other; use [`Dedup::keyed`] for that.
pub struct Dedup<Op: Operation, K: Eq + Hash + Clone + Send + Sync + 'static = ()> {
    inner: Op,
    key_fn: KeyFn<K>,
    slots: Mutex<HashMap<K, Receiver<Op::Value, Op::Failure>>>,
}

impl<Op: Operation> Dedup<Op, ()> {
    /// Collapses every concurrent run of `inner` into a single slot, regardless of context.
    pub fn new(inner: Op) -> Self {
        Self::keyed(inner, |_| ())
    }
}

impl<Op: Operation, K: Eq + Hash + Clone + Send + Sync + 'static> Dedup<Op, K> {
    /// Collapses concurrent runs whose `key_fn(context)` compares equal.
    pub fn keyed(inner: Op, key_fn: impl Fn(&Context) -> K + Send + Sync + 'static) -> Self {
        Self {
            inner,
            key_fn: Box::new(key_fn),
            slots: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<V, F> {
    Leader(watch::Sender<Option<SharedResult<V, F>>>),
    Follower(Receiver<V, F>),
}

#[async_trait]
impl<Op: Operation, K: Eq + Hash + Clone + Send + Sync + 'static> Operation for Dedup<Op, K>
where
    Op::Value: Clone,
    Op::Failure: Clone,
{
    type Value = Op::Value;
    type Failure = Op::Failure;

    fn path(&self) -> Path {
        self.inner.path()
    }

    fn setup(&self, context: &mut Context) {
        self.inner.setup(context)
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        let key = (self.key_fn)(&context);

        let role = {
            let mut slots = self.slots.lock();
            match slots.get(&key).cloned() {
                Some(rx) if rx.borrow().is_none() => Role::Follower(rx),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => loop {
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(OperationError::Cancelled);
                }
            },
            Role::Leader(tx) => {
                let result = self.inner.run(context, continuation).await;
                let _ = tx.send(Some(result.clone()));
                self.slots.lock().remove(&key);
                result
            }
        }
    }
}
