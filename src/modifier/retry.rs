//! Retries a failing operation with exponential backoff and jitter.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::{CancellationTokenKey, Context, DelayerKey, MaxRetriesKey, RetryIndexKey};
use crate::continuation::Continuation;
use crate::error::OperationError;
use crate::operation::Operation;
use crate::path::Path;

/// Wraps an [`Operation`] to retry it on failure, with exponential backoff capped at `max_delay`
/// and jittered by `jitter_factor` (0.0–1.0) in either direction. `max_attempts` is the retry
/// limit, not the invocation count: the body is invoked `min(max_attempts, ctx.max_retries) + 1`
/// times in total (the initial attempt plus up to that many retries), with `retry_index` ranging
/// `0..=min(max_attempts, ctx.max_retries)`. The attempt index is exposed to the wrapped operation
/// through `RetryIndexKey`, and a `MaxRetriesKey` set in the run's own context can cap attempts
/// further still.
pub struct Retry<Op> {
    inner: Op,
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    growth_factor: f64,
    jitter_factor: f64,
}

impl<Op> Retry<Op> {
    pub fn new(inner: Op, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            growth_factor: 2.0,
            jitter_factor: 0.1,
        }
    }

    pub fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_growth_factor(mut self, growth_factor: f64) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.growth_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter_range = capped * self.jitter_factor;
        let jitter = {
            use std::time::{SystemTime, UNIX_EPOCH};
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos();
            let random_factor = nanos as f64 / 1_000_000_000.0;
            (random_factor * jitter_range).mul_add(2.0, -jitter_range)
        };
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

#[async_trait]
impl<Op: Operation> Operation for Retry<Op> {
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
        let hard_cap = context.get::<MaxRetriesKey>();
        let attempts = self.max_attempts.min(hard_cap).saturating_add(1);
        let delayer = context.get::<DelayerKey>();
        let cancel = context.get::<CancellationTokenKey>();

        for attempt in 0..attempts {
            let attempt_context = context.clone().with::<RetryIndexKey>(attempt);
            match self.inner.run(attempt_context, continuation.clone()).await {
                Ok(value) => return Ok(value),
                Err(OperationError::Cancelled) => return Err(OperationError::Cancelled),
                Err(OperationError::Failed(failure) | OperationError::RetriesExhausted(failure)) => {
                    if attempt + 1 == attempts || cancel.is_cancelled() {
                        return Err(OperationError::RetriesExhausted(failure));
                    }
                    delayer.delay(self.delay_for_attempt(attempt), &cancel).await;
                    if cancel.is_cancelled() {
                        return Err(OperationError::Cancelled);
                    }
                }
            }
        }

        unreachable!("attempts is clamped to at least 1, and the last iteration always returns")
    }
}
