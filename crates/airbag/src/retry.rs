// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Retry scheduling.
//!
//! The schedule decides, after each failed attempt, whether the engine should try
//! again and how long to pause first. It never executes anything itself; the
//! executor owns the loop so bulkhead slots and breaker admission are re-evaluated
//! per attempt.

use std::time::Duration;

use crate::config::{OverrideTable, Property};
use crate::kind::{FaultKind, KindSet};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Re-invoke after pausing for the given backoff.
    Retry { after: Duration },
    /// The failure is terminal for this execution.
    GiveUp,
}

#[derive(Debug)]
pub(crate) struct RetrySchedule {
    max_retries: Property<u32>,
    delay: Property<Duration>,
    jitter: Property<Duration>,
    retry_on: KindSet,
    abort_on: KindSet,
}

impl RetrySchedule {
    pub fn new(
        max_retries: Property<u32>,
        delay: Property<Duration>,
        jitter: Property<Duration>,
        retry_on: KindSet,
        abort_on: KindSet,
    ) -> Self {
        Self {
            max_retries,
            delay,
            jitter,
            retry_on,
            abort_on,
        }
    }

    /// Decides the fate of attempt number `attempt` (1-based) that failed with a
    /// fault of `kind`.
    ///
    /// `abort-on` takes precedence over `retry-on`: a kind in both sets aborts. At
    /// most `max-retries` retries are granted, so `max-retries + 1` attempts run in
    /// total.
    pub fn decide(&self, overrides: &OverrideTable, attempt: u32, kind: FaultKind) -> Decision {
        if attempt > self.max_retries.current(overrides) {
            return Decision::GiveUp;
        }
        if self.abort_on.contains(kind) || !self.retry_on.contains(kind) {
            return Decision::GiveUp;
        }
        Decision::Retry {
            after: backoff(self.delay.current(overrides), self.jitter.current(overrides)),
        }
    }
}

/// Uniform backoff in `delay ± jitter`, saturating at zero.
fn backoff(delay: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return delay;
    }
    let spread = jitter.as_nanos().min(u128::from(u64::MAX / 2)) as u64;
    let offset = Duration::from_nanos(fastrand::u64(0..=spread * 2));
    delay.saturating_add(offset).saturating_sub(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{precedence_paths, ConfigValue, PolicyType};
    use crate::kind::Fault;

    #[derive(Debug, thiserror::Error)]
    #[error("flaky")]
    struct Flaky;

    impl Fault for Flaky {}

    const BUSY: FaultKind = FaultKind::new("test.busy");

    fn schedule(max_retries: u32, delay: Duration, jitter: Duration, retry_on: KindSet, abort_on: KindSet) -> RetrySchedule {
        let paths = |property| precedence_paths("Svc-op", "Svc", PolicyType::Retry, property);
        RetrySchedule::new(
            Property::new(max_retries, paths("max-retries")),
            Property::new(delay, paths("delay")),
            Property::new(jitter, paths("jitter")),
            retry_on,
            abort_on,
        )
    }

    #[test]
    fn grants_exactly_max_retries_retries() {
        let overrides = OverrideTable::default();
        let schedule = schedule(2, Duration::ZERO, Duration::ZERO, KindSet::Any, KindSet::Empty);

        let kind = Flaky.kind();
        assert!(matches!(schedule.decide(&overrides, 1, kind), Decision::Retry { .. }));
        assert!(matches!(schedule.decide(&overrides, 2, kind), Decision::Retry { .. }));
        assert_eq!(schedule.decide(&overrides, 3, kind), Decision::GiveUp);
    }

    #[test]
    fn abort_on_wins_over_retry_on() {
        let overrides = OverrideTable::default();
        let schedule = schedule(
            5,
            Duration::ZERO,
            Duration::ZERO,
            KindSet::of(&[BUSY]),
            KindSet::of(&[BUSY]),
        );

        assert_eq!(schedule.decide(&overrides, 1, BUSY), Decision::GiveUp);
    }

    #[test]
    fn kinds_outside_retry_on_are_terminal() {
        let overrides = OverrideTable::default();
        let schedule = schedule(5, Duration::ZERO, Duration::ZERO, KindSet::of(&[BUSY]), KindSet::Empty);

        assert_eq!(schedule.decide(&overrides, 1, FaultKind::TIMEOUT), Decision::GiveUp);
        assert!(matches!(schedule.decide(&overrides, 1, BUSY), Decision::Retry { .. }));
    }

    #[test]
    fn backoff_stays_within_the_jitter_band() {
        let delay = Duration::from_millis(100);
        let jitter = Duration::from_millis(30);

        for _ in 0..200 {
            let pause = backoff(delay, jitter);
            assert!(pause >= Duration::from_millis(70), "{pause:?}");
            assert!(pause <= Duration::from_millis(130), "{pause:?}");
        }
    }

    #[test]
    fn jitter_wider_than_delay_saturates_at_zero() {
        for _ in 0..200 {
            let pause = backoff(Duration::from_millis(10), Duration::from_millis(50));
            assert!(pause <= Duration::from_millis(60), "{pause:?}");
        }
    }

    #[test]
    fn max_retries_reload_is_read_per_decision() {
        let overrides = OverrideTable::default();
        let schedule = schedule(0, Duration::ZERO, Duration::ZERO, KindSet::Any, KindSet::Empty);

        let kind = Flaky.kind();
        assert_eq!(schedule.decide(&overrides, 1, kind), Decision::GiveUp);

        overrides.insert("fault-tolerance.retry.max-retries".to_owned(), ConfigValue::Int(1));
        assert!(matches!(schedule.decide(&overrides, 1, kind), Decision::Retry { .. }));
    }
}
