//! Composable wrappers that inject production behavior around a user's [`Operation`] body.
//!
//! Two shapes, per the crate's design: a *context-updating* modifier only mutates the effective
//! `Context` in [`Operation::setup`](crate::operation::Operation::setup) and otherwise delegates
//! `run` straight through; a *full* modifier may additionally intercept `run` itself (`Retry`,
//! `Dedup`, `Suspend`, `LogDuration`). `RerunOnChange` is neither — it's a controller that
//! attaches to a live [`Store`](crate::store::Store) rather than wrapping an `Operation`.

pub mod dedup;
pub mod retry;
pub mod suspend;

pub use dedup::Dedup;
pub use retry::Retry;
pub use suspend::Suspend;

use async_trait::async_trait;

use crate::context::{
    AutomaticRunningSpecificationKey, Context, EvictablePressureKey, IsAppActiveRerunEnabledKey,
    SatisfiedConnectionStatusKey,
};
use crate::continuation::Continuation;
use crate::error::OperationError;
use crate::observer::{ConnectionStatus, PressureMask};
use crate::operation::Operation;
use crate::path::Path;
use crate::run_specification::RunSpecification;

/// Sets `context::AutomaticRunningSpecificationKey`, gating whether a store is allowed to start a
/// run on its own (first subscriber while stale, or a [`RerunOnChange`] trigger) rather than only
/// in response to an explicit caller-initiated `run`.
pub struct EnableAutomaticRunning<Op> {
    inner: Op,
    specification: RunSpecification,
}

impl<Op> EnableAutomaticRunning<Op> {
    pub fn new(inner: Op, specification: RunSpecification) -> Self {
        Self {
            inner,
            specification,
        }
    }
}

#[async_trait]
impl<Op: Operation> Operation for EnableAutomaticRunning<Op> {
    type Value = Op::Value;
    type Failure = Op::Failure;

    fn path(&self) -> Path {
        self.inner.path()
    }

    fn setup(&self, context: &mut Context) {
        self.inner.setup(context);
        context.set::<AutomaticRunningSpecificationKey>(self.specification.clone());
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        self.inner.run(context, continuation).await
    }
}

/// Sets `context::IsAppActiveRerunEnabledKey`, opting a store out of the automatic rerun that
/// normally fires when the host application returns to the foreground.
pub struct DisableApplicationActiveRerunning<Op> {
    inner: Op,
    disabled: bool,
}

impl<Op> DisableApplicationActiveRerunning<Op> {
    pub fn new(inner: Op, disabled: bool) -> Self {
        Self { inner, disabled }
    }
}

#[async_trait]
impl<Op: Operation> Operation for DisableApplicationActiveRerunning<Op> {
    type Value = Op::Value;
    type Failure = Op::Failure;

    fn path(&self) -> Path {
        self.inner.path()
    }

    fn setup(&self, context: &mut Context) {
        self.inner.setup(context);
        context.set::<IsAppActiveRerunEnabledKey>(!self.disabled);
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        self.inner.run(context, continuation).await
    }
}

/// Sets `context::EvictablePressureKey`, opting a store's [`Store`](crate::store::Store) in to
/// eviction from a [`StoreCache`](crate::cache::StoreCache) at the given pressure levels whenever
/// it has no subscribers.
pub struct EvictWhen<Op> {
    inner: Op,
    mask: PressureMask,
}

impl<Op> EvictWhen<Op> {
    pub fn new(inner: Op, mask: PressureMask) -> Self {
        Self { inner, mask }
    }
}

#[async_trait]
impl<Op: Operation> Operation for EvictWhen<Op> {
    type Value = Op::Value;
    type Failure = Op::Failure;

    fn path(&self) -> Path {
        self.inner.path()
    }

    fn setup(&self, context: &mut Context) {
        self.inner.setup(context);
        context.set::<EvictablePressureKey>(self.mask);
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        self.inner.run(context, continuation).await
    }
}

/// Sets `context::SatisfiedConnectionStatusKey`, the minimum connectivity level a
/// `RunSpecification::connected` must observe before this operation is considered runnable.
pub struct SatisfiedConnectionStatus<Op> {
    inner: Op,
    level: ConnectionStatus,
}

impl<Op> SatisfiedConnectionStatus<Op> {
    pub fn new(inner: Op, level: ConnectionStatus) -> Self {
        Self { inner, level }
    }
}

#[async_trait]
impl<Op: Operation> Operation for SatisfiedConnectionStatus<Op> {
    type Value = Op::Value;
    type Failure = Op::Failure;

    fn path(&self) -> Path {
        self.inner.path()
    }

    fn setup(&self, context: &mut Context) {
        self.inner.setup(context);
        context.set::<SatisfiedConnectionStatusKey>(self.level);
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        self.inner.run(context, continuation).await
    }
}

/// Wraps an operation to record its run duration via `context.clock`, emitting a `tracing` event
/// at `level` on completion. The elapsed time is computed from the injectable clock, never
/// `Instant::now()`, so tests driving a fake clock stay deterministic.
pub struct LogDuration<Op> {
    inner: Op,
    level: tracing::Level,
}

impl<Op> LogDuration<Op> {
    pub fn new(inner: Op, level: tracing::Level) -> Self {
        Self { inner, level }
    }
}

#[async_trait]
impl<Op: Operation> Operation for LogDuration<Op> {
    type Value = Op::Value;
    type Failure = Op::Failure;

    fn path(&self) -> Path {
        self.inner.path()
    }

    fn setup(&self, context: &mut Context) {
        self.inner.setup(context);
    }

    async fn run(
        &self,
        context: Context,
        continuation: Continuation<Self::Value, Self::Failure>,
    ) -> Result<Self::Value, OperationError<Self::Failure>> {
        use crate::context::ClockKey;

        let clock = context.get::<ClockKey>();
        let path = self.inner.path();
        let started_at = clock.now();
        let result = self.inner.run(context, continuation).await;
        let elapsed_millis = clock.now().0.saturating_sub(started_at.0);

        match self.level {
            tracing::Level::ERROR => {
                tracing::error!(?path, elapsed_millis, ok = result.is_ok(), "operation finished")
            }
            tracing::Level::WARN => {
                tracing::warn!(?path, elapsed_millis, ok = result.is_ok(), "operation finished")
            }
            tracing::Level::INFO => {
                tracing::info!(?path, elapsed_millis, ok = result.is_ok(), "operation finished")
            }
            tracing::Level::DEBUG => {
                tracing::debug!(?path, elapsed_millis, ok = result.is_ok(), "operation finished")
            }
            tracing::Level::TRACE => {
                tracing::trace!(?path, elapsed_millis, ok = result.is_ok(), "operation finished")
            }
        }
        result
    }
}

/// A controller, not an `Operation` wrapper: attaches to a live store and reruns it whenever
/// `specification` transitions false → true while the store has at least one subscriber, is
/// stale, and automatic running is enabled. A true → false transition cancels any rerun it
/// started. See [`crate::store::Store::attach_rerun_on_change`] for the attachment point — kept
/// on `Store` itself because the controller needs the store's subscriber count, staleness, and
/// run method, none of which an `Operation` wrapper has access to.
pub struct RerunOnChange {
    pub specification: RunSpecification,
}

impl RerunOnChange {
    pub fn new(specification: RunSpecification) -> Self {
        Self { specification }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        AutomaticRunningSpecificationKey, EvictablePressureKey, IsAppActiveRerunEnabledKey,
        SatisfiedConnectionStatusKey,
    };
    use crate::continuation::Continuation;
    use crate::operation::{QueryAdapter, QueryOperation};
    use crate::task::TaskId;

    struct Constant;

    #[async_trait]
    impl QueryOperation for Constant {
        type Value = u32;
        type Failure = &'static str;

        fn path(&self) -> Path {
            Path::of("constant")
        }

        async fn fetch(
            &self,
            _context: Context,
            _continuation: Continuation<u32, &'static str>,
        ) -> Result<u32, OperationError<&'static str>> {
            Ok(1)
        }
    }

    fn null_continuation() -> Continuation<u32, &'static str> {
        Continuation::new(std::sync::Weak::new(), TaskId::from_raw(1), 0)
    }

    #[tokio::test]
    async fn enable_automatic_running_sets_the_context_key_at_setup() {
        let op = EnableAutomaticRunning::new(QueryAdapter(Constant), RunSpecification::always(false));
        let mut context = Context::new();
        op.setup(&mut context);
        assert!(!context.get::<AutomaticRunningSpecificationKey>().is_satisfied());
        let result = op.run(context, null_continuation()).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn disable_application_active_rerunning_flips_the_flag() {
        let op = DisableApplicationActiveRerunning::new(QueryAdapter(Constant), true);
        let mut context = Context::new();
        op.setup(&mut context);
        assert!(!context.get::<IsAppActiveRerunEnabledKey>());
    }

    #[tokio::test]
    async fn evict_when_sets_the_pressure_mask() {
        let op = EvictWhen::new(QueryAdapter(Constant), PressureMask::WARNING);
        let mut context = Context::new();
        op.setup(&mut context);
        assert!(context.get::<EvictablePressureKey>().contains(crate::observer::Pressure::Warning));
    }

    #[tokio::test]
    async fn satisfied_connection_status_sets_the_level() {
        let op = SatisfiedConnectionStatus::new(QueryAdapter(Constant), ConnectionStatus::Connected);
        let mut context = Context::new();
        op.setup(&mut context);
        assert_eq!(context.get::<SatisfiedConnectionStatusKey>(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn log_duration_passes_through_the_result() {
        let op = LogDuration::new(QueryAdapter(Constant), tracing::Level::DEBUG);
        let result = op.run(Context::new(), null_continuation()).await;
        assert_eq!(result.unwrap(), 1);
    }
}
