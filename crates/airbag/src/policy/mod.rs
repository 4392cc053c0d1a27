// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Declarative resilience policies and their resolution into cached per-operation
//! policy sets.
//!
//! Declarations mirror what an annotation-driven binding layer collects from a
//! guarded method: each policy can be declared at method scope or at type scope
//! (method wins; a type-scoped declaration applies uniformly to every method of the
//! type), and every declared value can be overridden through configuration at
//! resolution time and hot-reloaded afterwards.

pub(crate) mod fallback;
pub(crate) mod resolver;

use std::time::Duration;

use crate::kind::KindSet;

/// Where a policy was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Declared on the guarded method itself.
    Method,
    /// Declared on the enclosing type and inherited by its methods.
    Type,
}

/// A policy's method- and type-scoped declarations, as collected by the binding layer.
#[derive(Debug, Clone)]
pub(crate) struct PolicyDeclaration<P> {
    pub method: Option<P>,
    pub type_level: Option<P>,
}

// Not derived: a derived `Default` would demand `P: Default`, and an empty
// declaration must exist for every policy type.
impl<P> Default for PolicyDeclaration<P> {
    fn default() -> Self {
        Self {
            method: None,
            type_level: None,
        }
    }
}

impl<P> PolicyDeclaration<P> {
    /// The declaration that applies: method scope over type scope.
    pub fn effective(&self) -> Option<(&P, Scope)> {
        self.method
            .as_ref()
            .map(|p| (p, Scope::Method))
            .or_else(|| self.type_level.as_ref().map(|p| (p, Scope::Type)))
    }

    pub fn declared_at(&self, scope: Scope) -> bool {
        matches!(self.effective(), Some((_, s)) if s == scope)
    }
}

/// Concurrency limits isolating one operation's resource usage from others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadPolicy {
    pub(crate) max_concurrent: u32,
    pub(crate) waiting_queue_size: u32,
}

impl BulkheadPolicy {
    /// Creates a bulkhead admitting at most `max_concurrent` concurrent executions.
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            max_concurrent,
            waiting_queue_size: 0,
        }
    }

    /// Sets the waiting-queue capacity. Meaningful only for asynchronous operations;
    /// synchronous ones reject immediately when the concurrency limit is reached.
    #[must_use]
    pub fn waiting_queue_size(mut self, size: u32) -> Self {
        self.waiting_queue_size = size;
        self
    }
}

/// Deadline applied to each attempt of the guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub(crate) value: Duration,
}

impl TimeoutPolicy {
    /// Creates a timeout policy with the given deadline.
    #[must_use]
    pub fn new(value: Duration) -> Self {
        Self { value }
    }
}

/// Bounded re-invocation of a failed call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub(crate) max_retries: u32,
    pub(crate) delay: Duration,
    pub(crate) jitter: Duration,
    pub(crate) retry_on: KindSet,
    pub(crate) abort_on: KindSet,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
            retry_on: KindSet::Any,
            abort_on: KindSet::Empty,
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy allowing up to `max_retries` re-invocations
    /// (`max_retries + 1` attempts in total).
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Sets the fixed delay between attempts.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the jitter applied to the delay, uniformly in `±jitter`.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Restricts retries to failures of the given kinds. Defaults to any.
    #[must_use]
    pub fn retry_on(mut self, kinds: KindSet) -> Self {
        self.retry_on = kinds;
        self
    }

    /// Short-circuits retries for failures of the given kinds, even when they also
    /// match `retry_on`. Defaults to none.
    #[must_use]
    pub fn abort_on(mut self, kinds: KindSet) -> Self {
        self.abort_on = kinds;
        self
    }
}

/// Rolling-window failure detection with fail-fast cooldown.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerPolicy {
    pub(crate) fail_on: KindSet,
    pub(crate) delay: Duration,
    pub(crate) request_volume_threshold: u32,
    pub(crate) failure_ratio: f64,
    pub(crate) success_threshold: u32,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            fail_on: KindSet::Any,
            delay: Duration::from_secs(5),
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerPolicy {
    /// Creates a circuit-breaker policy with the default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts which failure kinds count against the rolling window. Failures
    /// outside the set do not affect breaker state at all.
    #[must_use]
    pub fn fail_on(mut self, kinds: KindSet) -> Self {
        self.fail_on = kinds;
        self
    }

    /// Sets how long the breaker stays open before probing.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the rolling-window size: the number of most recent outcomes considered.
    #[must_use]
    pub fn request_volume_threshold(mut self, threshold: u32) -> Self {
        self.request_volume_threshold = threshold;
        self
    }

    /// Sets the failure ratio, in `(0, 1]`, at which a full window opens the breaker.
    #[must_use]
    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    /// Sets how many consecutive half-open trial successes close the breaker.
    #[must_use]
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_scope_wins_over_type_scope() {
        let declaration = PolicyDeclaration {
            method: Some(RetryPolicy::new(1)),
            type_level: Some(RetryPolicy::new(9)),
        };

        let (policy, scope) = declaration.effective().unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(scope, Scope::Method);
    }

    #[test]
    fn empty_declaration_exists_for_every_policy() {
        assert!(PolicyDeclaration::<TimeoutPolicy>::default().effective().is_none());
        assert!(PolicyDeclaration::<BulkheadPolicy>::default().effective().is_none());
    }

    #[test]
    fn type_scope_applies_when_method_is_silent() {
        let declaration = PolicyDeclaration {
            method: None,
            type_level: Some(BulkheadPolicy::new(4)),
        };

        let (policy, scope) = declaration.effective().unwrap();
        assert_eq!(policy.max_concurrent, 4);
        assert_eq!(scope, Scope::Type);
        assert!(declaration.declared_at(Scope::Type));
        assert!(!declaration.declared_at(Scope::Method));
    }
}
