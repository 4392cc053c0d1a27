// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The guarded-call pipeline.
//!
//! [`FaultTolerance`] is the engine's entry point. Each execution drains pending
//! configuration updates, resolves (or fetches) the operation's cached policy set,
//! then drives the call through bulkhead admission, per-attempt circuit-breaker
//! admission and deadline enforcement, the retry loop, and finally fallback
//! dispatch when the whole pipeline fails.

use std::sync::Arc;

use crate::breaker::{CircuitBreaker, Outcome, Transition, Verdict};
use crate::bulkhead::{Admission, BulkheadPermit};
use crate::config::watch::ConfigWatch;
use crate::config::{ConfigSource, NoopConfigSource, OverrideTable};
use crate::error::FaultError;
use crate::kind::Fault;
use crate::metrics::{MetricKey, MetricsSink, NoopSink};
use crate::operation::OperationDefinition;
use crate::policy::resolver::PolicySet;
use crate::registry::OperationRegistry;
use crate::retry::Decision;

/// The fault-tolerance engine.
///
/// Cheap to clone; clones share the policy cache, override table, and
/// configuration subscriptions. Build one per process (or per configuration
/// source) and reuse it for every guarded operation.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use airbag::{FaultTolerance, OperationDefinition, RetryPolicy, SignatureDescriptor, TimeoutPolicy};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("upstream unavailable")]
/// struct Unavailable;
/// impl airbag::Fault for Unavailable {}
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = FaultTolerance::new();
/// let definition = OperationDefinition::<u64, Unavailable>::new(
///     SignatureDescriptor::of::<u64>("Ledger", "balance"),
/// )
/// .timeout(TimeoutPolicy::new(Duration::from_millis(200)))
/// .retry(RetryPolicy::new(2));
///
/// let balance = engine.execute(&definition, || async { Ok(42_u64) }).await?;
/// assert_eq!(balance, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FaultTolerance {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FaultTolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultTolerance").finish_non_exhaustive()
    }
}

struct Shared {
    source: Arc<dyn ConfigSource>,
    watch: ConfigWatch,
    overrides: OverrideTable,
    registry: OperationRegistry,
    sink: Arc<dyn MetricsSink>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.watch.unsubscribe_all(self.source.as_ref());
    }
}

/// Configures and builds a [`FaultTolerance`] engine.
pub struct FaultToleranceBuilder {
    source: Arc<dyn ConfigSource>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for FaultToleranceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultToleranceBuilder").finish_non_exhaustive()
    }
}

impl FaultToleranceBuilder {
    fn new() -> Self {
        Self {
            source: Arc::new(NoopConfigSource),
            sink: Arc::new(NoopSink),
        }
    }

    /// Uses `source` for startup property resolution and hot reload.
    #[must_use]
    pub fn config_source(mut self, source: impl ConfigSource) -> Self {
        self.source = Arc::new(source);
        self
    }

    /// Reports engine metrics to `sink`.
    #[must_use]
    pub fn metrics_sink(mut self, sink: impl MetricsSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Builds the engine, reading the watch configuration from the source.
    #[must_use]
    pub fn build(self) -> FaultTolerance {
        let watch = ConfigWatch::new(self.source.as_ref());
        FaultTolerance {
            shared: Arc::new(Shared {
                source: self.source,
                watch,
                overrides: OverrideTable::default(),
                registry: OperationRegistry::default(),
                sink: self.sink,
            }),
        }
    }
}

impl Default for FaultTolerance {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultTolerance {
    /// An engine with no configuration source and no metrics sink; declared policy
    /// values apply unchanged.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> FaultToleranceBuilder {
        FaultToleranceBuilder::new()
    }

    /// Runs `operation` under the policies declared by `definition`.
    ///
    /// `operation` is invoked once per attempt; the retry policy, when declared,
    /// re-invokes it after retryable failures. Definition errors surface as
    /// [`FaultError::Definition`] without invoking the operation or its fallback.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`FaultError`] when the pipeline fails and no fallback
    /// produces a substitute result.
    pub async fn execute<T, E, F, Fut>(
        &self,
        definition: &OperationDefinition<T, E>,
        operation: F,
    ) -> Result<T, FaultError<E>>
    where
        T: 'static,
        E: Fault + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let shared = &*self.shared;
        shared.watch.drain(&shared.overrides);

        let set = shared
            .registry
            .resolve(definition, shared.source.as_ref(), &shared.watch, &shared.overrides)?;
        let binding = set.fallback::<T, E>()?;

        shared.sink.increment(&set.metrics.invocations);

        match self.run_guarded(&set, operation).await {
            Ok(value) => Ok(value),
            Err(failure) => {
                shared.sink.increment(&set.metrics.failures);
                tracing::debug!(operation = %set.key, error = %failure, "guarded call failed");

                let fallback_metrics = set.metrics.fallback.as_ref();
                match binding.dispatch(&failure) {
                    Ok(None) => Err(failure),
                    Ok(Some(value)) => {
                        if let Some(metrics) = fallback_metrics {
                            shared.sink.increment(&metrics.invoked);
                        }
                        Ok(value)
                    }
                    Err(error) => {
                        if let Some(metrics) = fallback_metrics {
                            shared.sink.increment(&metrics.invoked);
                            shared.sink.increment(&metrics.failed);
                        }
                        Err(FaultError::FallbackFailed {
                            error,
                            cause: Box::new(failure),
                        })
                    }
                }
            }
        }
    }

    async fn run_guarded<T, E, F, Fut>(&self, set: &PolicySet, mut operation: F) -> Result<T, FaultError<E>>
    where
        E: Fault + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let shared = &*self.shared;
        let overrides = &shared.overrides;
        let sink = shared.sink.as_ref();

        let _slot = match &set.bulkhead {
            Some(bulkhead) => {
                let metrics = set.metrics.bulkhead.as_ref();
                let gauge = metrics.map(|m| (sink, &m.waiting));
                match bulkhead.admit(overrides, gauge).await {
                    Admission::Granted { permit, waited } => {
                        if let Some(metrics) = metrics {
                            sink.increment(&metrics.accepted);
                            if let Some(waited) = waited {
                                sink.observe(&metrics.wait_duration, waited);
                            }
                        }
                        Some(ExecutionSlot::new(permit, sink, metrics.map(|m| &m.executing)))
                    }
                    Admission::Rejected => {
                        if let Some(metrics) = metrics {
                            sink.increment(&metrics.rejected);
                        }
                        tracing::debug!(operation = %set.key, "bulkhead rejected guarded call");
                        return Err(FaultError::BulkheadRejected {
                            operation: set.key.clone(),
                        });
                    }
                }
            }
            None => None,
        };

        let mut attempt: u32 = 1;
        loop {
            let trial = match &set.breaker {
                Some(guard) => {
                    let (verdict, transition) = guard.breaker.try_enter(overrides);
                    if let Some(transition) = transition {
                        note_transition(sink, set, transition);
                    }
                    match verdict {
                        Verdict::Admitted { trial } => Some(trial),
                        Verdict::Rejected => {
                            if let Some(metrics) = set.metrics.breaker.as_ref() {
                                sink.increment(&metrics.prevented);
                            }
                            return Err(FaultError::CircuitOpen {
                                operation: set.key.clone(),
                            });
                        }
                    }
                }
                None => None,
            };

            // Hands the half-open trial slot back if this attempt is cancelled
            // before its outcome is recorded.
            let mut trial_slot = match (&set.breaker, trial) {
                (Some(guard), Some(true)) => Some(TrialSlot::new(&guard.breaker)),
                _ => None,
            };

            let result = match &set.timeout {
                Some(guard) => match guard.run(overrides, operation()).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(FaultError::Execution(error)),
                    Err(limit) => {
                        if let Some(metrics) = set.metrics.timeout.as_ref() {
                            sink.increment(&metrics.timed_out);
                        }
                        Err(FaultError::Timeout { limit })
                    }
                },
                None => operation().await.map_err(FaultError::Execution),
            };

            if let (Some(guard), Some(trial)) = (&set.breaker, trial) {
                let score = match &result {
                    Ok(_) => Outcome::Success,
                    // A deadline expiry always counts against the breaker;
                    // `fail-on` filters only the call's own errors.
                    Err(FaultError::Timeout { .. }) => Outcome::Failure,
                    Err(failure) => match failure.fault_kind() {
                        Some(kind) if guard.fail_on.contains(kind) => Outcome::Failure,
                        _ => Outcome::Ignored,
                    },
                };
                if let Some(slot) = trial_slot.as_mut() {
                    slot.disarm();
                }
                if let Some(transition) = guard.breaker.record(overrides, trial, score) {
                    note_transition(sink, set, transition);
                }
            }

            let failure = match result {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            let Some(schedule) = &set.retry else {
                return Err(failure);
            };
            let Some(kind) = failure.fault_kind() else {
                return Err(failure);
            };

            match schedule.decide(overrides, attempt, kind) {
                Decision::Retry { after } => {
                    if let Some(metrics) = set.metrics.retry.as_ref() {
                        sink.increment(&metrics.retries);
                    }
                    tracing::debug!(operation = %set.key, attempt, backoff = ?after, "retrying guarded call");
                    if !after.is_zero() {
                        tokio::time::sleep(after).await;
                    }
                    attempt += 1;
                }
                Decision::GiveUp => {
                    if let Some(metrics) = set.metrics.retry.as_ref() {
                        sink.increment(&metrics.exhausted);
                    }
                    return Err(failure);
                }
            }
        }
    }
}

/// Keeps the concurrent-executions gauge honest for the lifetime of a bulkhead
/// permit, whichever way the pipeline exits.
struct ExecutionSlot<'a> {
    _permit: BulkheadPermit,
    gauge: Option<(&'a dyn MetricsSink, &'a MetricKey)>,
}

impl<'a> ExecutionSlot<'a> {
    fn new(permit: BulkheadPermit, sink: &'a dyn MetricsSink, key: Option<&'a MetricKey>) -> Self {
        let gauge = key.map(|key| {
            sink.adjust(key, 1);
            (sink, key)
        });
        Self { _permit: permit, gauge }
    }
}

impl Drop for ExecutionSlot<'_> {
    fn drop(&mut self) {
        if let Some((sink, key)) = self.gauge {
            sink.adjust(key, -1);
        }
    }
}

/// Releases the half-open trial slot when the trial attempt is dropped without
/// its outcome reaching the breaker.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> TrialSlot<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self { breaker, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}

fn note_transition(sink: &dyn MetricsSink, set: &PolicySet, transition: Transition) {
    let metrics = set.metrics.breaker.as_ref();
    match transition {
        Transition::Opened => {
            if let Some(metrics) = metrics {
                sink.increment(&metrics.opened);
            }
            tracing::warn!(operation = %set.key, "circuit breaker opened");
        }
        Transition::HalfOpened => {
            if let Some(metrics) = metrics {
                sink.increment(&metrics.half_opened);
            }
            tracing::debug!(operation = %set.key, "circuit breaker half-opened");
        }
        Transition::Closed => {
            if let Some(metrics) = metrics {
                sink.increment(&metrics.closed);
            }
            tracing::info!(operation = %set.key, "circuit breaker closed");
        }
    }
}
