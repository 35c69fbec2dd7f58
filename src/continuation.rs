//! A write-only sink handed to a running operation body so it can publish intermediate results.

use std::sync::Weak;

use crate::error::OperationError;
use crate::task::TaskId;

/// Implemented by a store's inner state so a [`Continuation`] can apply a yield without knowing
/// anything about the store beyond this one method. Held behind a `Weak` reference rather than an
/// `mpsc` channel: a yield is a direct, synchronous call into the same guarded update path a
/// task's final return uses, so the two can never observe each other out of order.
pub trait ResultSink<V, F>: Send + Sync {
    /// Applies a yielded result, but only if `herd` still matches the store's current herd —
    /// otherwise the store has since been reset and this yield is silently dropped.
    fn yield_result(&self, task_id: TaskId, herd: u64, result: Result<V, OperationError<F>>);
}

/// Handed to a running operation body so it can publish zero or more intermediate results before
/// its final return. Every yield and the eventual return apply through the same guarded update
/// path, so a yield can never race past a concurrent reset and corrupt the visible state.
pub struct Continuation<V, F> {
    sink: Weak<dyn ResultSink<V, F>>,
    task_id: TaskId,
    herd: u64,
}

impl<V, F> Continuation<V, F> {
    pub(crate) fn new(sink: Weak<dyn ResultSink<V, F>>, task_id: TaskId, herd: u64) -> Self {
        Self {
            sink,
            task_id,
            herd,
        }
    }

    /// Publishes an intermediate value. A no-op if the owning store has already been dropped or
    /// reset since this task started.
    pub fn yield_value(&self, value: V) {
        if let Some(sink) = self.sink.upgrade() {
            sink.yield_result(self.task_id, self.herd, Ok(value));
        }
    }

    /// Publishes an intermediate failure without ending the run — the task may still recover and
    /// yield a success, or return one, afterward.
    pub fn yield_error(&self, error: OperationError<F>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.yield_result(self.task_id, self.herd, Err(error));
        }
    }
}

impl<V, F> Clone for Continuation<V, F> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            task_id: self.task_id,
            herd: self.herd,
        }
    }
}
