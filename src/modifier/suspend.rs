//! Suspends a run until a [`RunSpecification`] is satisfied before letting it proceed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::context::{CancellationTokenKey, Context};
use crate::continuation::Continuation;
use crate::error::OperationError;
use crate::operation::Operation;
use crate::path::Path;
use crate::run_specification::RunSpecification;

/// Wraps an [`Operation`] so its run doesn't start executing until `specification` reports
/// satisfied. Useful for gating a mutation on `connected`, or a query on "app is in the
/// foreground," without the operation body itself needing to know about either.
pub struct Suspend<Op> {
    inner: Op,
    specification: RunSpecification,
}

impl<Op> Suspend<Op> {
    pub fn new(inner: Op, specification: RunSpecification) -> Self {
        Self {
            inner,
            specification,
        }
    }

    /// Waits for `specification` to become satisfied, or returns early if `cancel` fires first —
    /// in which case the caller must treat the run as cancelled without invoking the inner body.
    async fn wait_until_satisfied(&self, cancel: &tokio_util::sync::CancellationToken) -> bool {
        if self.specification.is_satisfied() {
            return true;
        }
        let notify = Arc::new(Notify::new());
        let notify_clone = notify.clone();
        let _subscription = self.specification.subscribe(move |satisfied| {
            if satisfied {
                notify_clone.notify_one();
            }
        });
        while !self.specification.is_satisfied() {
            tokio::select! {
                _ = notify.notified() => {}
                _ = cancel.cancelled() => return false,
            }
        }
        true
    }
}

#[async_trait]
impl<Op: Operation> Operation for Suspend<Op> {
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
        let cancel = context.get::<CancellationTokenKey>();
        if !self.wait_until_satisfied(&cancel).await {
            return Err(OperationError::Cancelled);
        }
        self.inner.run(context, continuation).await
    }
}
