// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The metrics boundary.
//!
//! The engine emits counters and timers keyed by `(operation, policy, metric)`; it
//! owns no registry lifecycle. Plug a backend in by implementing [`MetricsSink`],
//! or enable the `metrics` feature for an OpenTelemetry-backed sink.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::config::PolicyType;
use crate::operation::OperationKey;

/// Identity of one metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    operation: OperationKey,
    policy: PolicyType,
    name: &'static str,
}

impl MetricKey {
    pub(crate) fn new(operation: OperationKey, policy: PolicyType, name: &'static str) -> Self {
        Self { operation, policy, name }
    }

    /// The operation this series belongs to.
    #[must_use]
    pub fn operation(&self) -> &OperationKey {
        &self.operation
    }

    /// The policy this series belongs to.
    #[must_use]
    pub fn policy(&self) -> PolicyType {
        self.policy
    }

    /// The metric name within the policy.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Display for MetricKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.operation, self.policy, self.name)
    }
}

/// Receives per-operation counters and timers.
pub trait MetricsSink: Send + Sync + 'static {
    /// Adds one to a counter series.
    fn increment(&self, key: &MetricKey);

    /// Moves a gauge-like series by `delta` (for example, currently-executing counts).
    fn adjust(&self, key: &MetricKey, delta: i64);

    /// Records one duration observation.
    fn observe(&self, key: &MetricKey, duration: Duration);
}

/// Discards every measurement. The default when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _key: &MetricKey) {}
    fn adjust(&self, _key: &MetricKey, _delta: i64) {}
    fn observe(&self, _key: &MetricKey, _duration: Duration) {}
}

/// Pre-built metric keys for one operation, assembled exactly once when the
/// operation's policy set is constructed.
#[derive(Debug)]
pub(crate) struct MetricsBundle {
    pub invocations: MetricKey,
    pub failures: MetricKey,
    pub bulkhead: Option<BulkheadMetrics>,
    pub breaker: Option<BreakerMetrics>,
    pub timeout: Option<TimeoutMetrics>,
    pub retry: Option<RetryMetrics>,
    pub fallback: Option<FallbackMetrics>,
}

#[derive(Debug)]
pub(crate) struct BulkheadMetrics {
    pub accepted: MetricKey,
    pub rejected: MetricKey,
    pub executing: MetricKey,
    pub waiting: MetricKey,
    pub wait_duration: MetricKey,
}

#[derive(Debug)]
pub(crate) struct BreakerMetrics {
    pub opened: MetricKey,
    pub closed: MetricKey,
    pub half_opened: MetricKey,
    pub prevented: MetricKey,
}

#[derive(Debug)]
pub(crate) struct TimeoutMetrics {
    pub timed_out: MetricKey,
}

#[derive(Debug)]
pub(crate) struct RetryMetrics {
    pub retries: MetricKey,
    pub exhausted: MetricKey,
}

#[derive(Debug)]
pub(crate) struct FallbackMetrics {
    pub invoked: MetricKey,
    pub failed: MetricKey,
}

pub(crate) struct BundleShape {
    pub bulkhead: bool,
    pub breaker: bool,
    pub timeout: bool,
    pub retry: bool,
    pub fallback: bool,
}

impl MetricsBundle {
    pub fn new(operation: &OperationKey, shape: &BundleShape) -> Self {
        let key = |policy, name| MetricKey::new(operation.clone(), policy, name);

        Self {
            invocations: key(PolicyType::Invocation, "invocations-total"),
            failures: key(PolicyType::Invocation, "invocations-failed-total"),
            bulkhead: shape.bulkhead.then(|| BulkheadMetrics {
                accepted: key(PolicyType::Bulkhead, "calls-accepted-total"),
                rejected: key(PolicyType::Bulkhead, "calls-rejected-total"),
                executing: key(PolicyType::Bulkhead, "concurrent-executions"),
                waiting: key(PolicyType::Bulkhead, "waiting-queue-population"),
                wait_duration: key(PolicyType::Bulkhead, "waiting-duration"),
            }),
            breaker: shape.breaker.then(|| BreakerMetrics {
                opened: key(PolicyType::CircuitBreaker, "opened-total"),
                closed: key(PolicyType::CircuitBreaker, "closed-total"),
                half_opened: key(PolicyType::CircuitBreaker, "half-opens-total"),
                prevented: key(PolicyType::CircuitBreaker, "calls-prevented-total"),
            }),
            timeout: shape.timeout.then(|| TimeoutMetrics {
                timed_out: key(PolicyType::Timeout, "calls-timed-out-total"),
            }),
            retry: shape.retry.then(|| RetryMetrics {
                retries: key(PolicyType::Retry, "retries-total"),
                exhausted: key(PolicyType::Retry, "calls-exhausted-total"),
            }),
            fallback: shape.fallback.then(|| FallbackMetrics {
                invoked: key(PolicyType::Fallback, "calls-total"),
                failed: key(PolicyType::Fallback, "failures-total"),
            }),
        }
    }
}

#[cfg(feature = "metrics")]
pub use self::otel::OtelSink;

#[cfg(feature = "metrics")]
mod otel {
    use std::time::Duration;

    use dashmap::DashMap;
    use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
    use opentelemetry::KeyValue;

    use super::{MetricKey, MetricsSink};

    type SeriesId = (&'static str, &'static str);

    /// Reports measurements through an OpenTelemetry [`Meter`].
    ///
    /// One instrument is created per `(policy, metric)` pair; the operation identity
    /// is carried as attributes, so every guarded operation shares the instruments.
    pub struct OtelSink {
        meter: Meter,
        counters: DashMap<SeriesId, Counter<u64>>,
        gauges: DashMap<SeriesId, UpDownCounter<i64>>,
        histograms: DashMap<SeriesId, Histogram<f64>>,
    }

    impl std::fmt::Debug for OtelSink {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("OtelSink").finish_non_exhaustive()
        }
    }

    impl OtelSink {
        /// Creates a sink reporting through the given meter.
        #[must_use]
        pub fn new(meter: Meter) -> Self {
            Self {
                meter,
                counters: DashMap::new(),
                gauges: DashMap::new(),
                histograms: DashMap::new(),
            }
        }

        fn series_id(key: &MetricKey) -> SeriesId {
            (key.policy().key(), key.name())
        }

        fn instrument_name(key: &MetricKey) -> String {
            format!("fault_tolerance.{}.{}", key.policy().key(), key.name())
        }

        fn attributes(key: &MetricKey) -> [KeyValue; 2] {
            [
                KeyValue::new("operation.command", key.operation().command().to_owned()),
                KeyValue::new("operation.group", key.operation().group().to_owned()),
            ]
        }
    }

    impl MetricsSink for OtelSink {
        fn increment(&self, key: &MetricKey) {
            let counter = self
                .counters
                .entry(Self::series_id(key))
                .or_insert_with(|| self.meter.u64_counter(Self::instrument_name(key)).build());
            counter.add(1, &Self::attributes(key));
        }

        fn adjust(&self, key: &MetricKey, delta: i64) {
            let gauge = self
                .gauges
                .entry(Self::series_id(key))
                .or_insert_with(|| self.meter.i64_up_down_counter(Self::instrument_name(key)).build());
            gauge.add(delta, &Self::attributes(key));
        }

        fn observe(&self, key: &MetricKey, duration: Duration) {
            let histogram = self
                .histograms
                .entry(Self::series_id(key))
                .or_insert_with(|| self.meter.f64_histogram(Self::instrument_name(key)).build());
            histogram.record(duration.as_secs_f64(), &Self::attributes(key));
        }
    }
}
