// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attempt deadlines.

use std::time::Duration;

use crate::config::{OverrideTable, Property};

/// Applies a live deadline to each attempt of a guarded call.
///
/// A zero deadline disables the guard; the attempt runs unbounded.
#[derive(Debug)]
pub(crate) struct TimeoutGuard {
    value: Property<Duration>,
}

impl TimeoutGuard {
    pub fn new(value: Property<Duration>) -> Self {
        Self { value }
    }

    /// Runs `future` under the current deadline. On expiry the future is dropped
    /// and the deadline that was exceeded is returned.
    pub async fn run<F>(&self, overrides: &OverrideTable, future: F) -> Result<F::Output, Duration>
    where
        F: Future,
    {
        let limit = self.value.current(overrides);
        if limit.is_zero() {
            return Ok(future.await);
        }
        match tokio::time::timeout(limit, future).await {
            Ok(output) => Ok(output),
            Err(_) => Err(limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{precedence_paths, ConfigValue, PolicyType};

    fn guard(limit: Duration) -> (TimeoutGuard, OverrideTable) {
        let paths = precedence_paths("Svc-op", "Svc", PolicyType::Timeout, "value");
        (TimeoutGuard::new(Property::new(limit, paths)), OverrideTable::default())
    }

    #[tokio::test(start_paused = true)]
    async fn completes_just_inside_the_deadline() {
        let (guard, overrides) = guard(Duration::from_millis(1000));
        let attempt = async {
            tokio::time::sleep(Duration::from_millis(999)).await;
            7_u32
        };
        assert_eq!(guard.run(&overrides, attempt).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_just_past_the_deadline() {
        let (guard, overrides) = guard(Duration::from_millis(1000));
        let attempt = async {
            tokio::time::sleep(Duration::from_millis(1001)).await;
            7_u32
        };
        assert_eq!(guard.run(&overrides, attempt).await, Err(Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_leaves_the_attempt_unbounded() {
        let (guard, overrides) = guard(Duration::ZERO);
        let attempt = async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            7_u32
        };
        assert_eq!(guard.run(&overrides, attempt).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reload_applies_to_the_next_attempt() {
        let (guard, overrides) = guard(Duration::from_millis(10));
        overrides.insert(
            "fault-tolerance.timeout.value".to_owned(),
            ConfigValue::Duration(Duration::from_millis(100)),
        );

        let attempt = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            7_u32
        };
        assert_eq!(guard.run(&overrides, attempt).await, Ok(7));
    }
}
