//! A single in-flight run of an operation.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::Context;

/// Identifies one run across its lifetime: scheduled, possibly yielding intermediate results,
/// and finally completed, cancelled, or superseded by a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub fn from_raw(value: u64) -> Self {
        TaskId(value)
    }
}

/// A handle to a task's cancellation mechanism, independent of awaiting its outcome. Cloning and
/// sharing this (rather than the task's `JoinHandle`) is how a [`Store`](crate::store::Store)
/// lets external callers cancel a run without taking ownership of it.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    cancellation: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Requests cooperative cancellation. The running body observes this through its `Context`'s
    /// cancellation token and the `Delayer`'s early-exit on `cancel.cancelled()`.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// One spawned run: its id, the context it executes with, its cancellation token, and the
/// `tokio` join handle for its eventual outcome.
pub struct Task<T> {
    id: TaskId,
    context: Context,
    cancellation: CancellationToken,
    join_handle: JoinHandle<T>,
}

impl<T> Task<T> {
    pub fn spawn<F>(context: Context, future: F) -> Self
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self::spawn_with_id(TaskId::next(), context, future)
    }

    /// Spawns with a caller-chosen id, so the id can be threaded into the future's own body (for
    /// example into a [`Continuation`](crate::continuation::Continuation)) before the task starts
    /// running.
    pub(crate) fn spawn_with_id<F>(id: TaskId, context: Context, future: F) -> Self
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let cancellation = CancellationToken::new();
        let join_handle = tokio::spawn(future);
        Self {
            id,
            context,
            cancellation,
            join_handle,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            cancellation: self.cancellation.clone(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Awaits the task's outcome. Panics propagate as a `JoinError`, mirroring
    /// `tokio::task::JoinHandle::await`'s own contract.
    pub async fn join(self) -> Result<T, tokio::task::JoinError> {
        self.join_handle.await
    }

    pub fn abort(&self) {
        self.cancellation.cancel();
        self.join_handle.abort();
    }
}
