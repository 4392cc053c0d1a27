// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resolution of a declared [`OperationDefinition`] into a cached [`PolicySet`].
//!
//! Resolution runs once per operation key. It validates the declaration, overlays
//! startup configuration onto the declared values, registers change watches for
//! every property path, and builds the live policy objects the executor drives on
//! each call. The produced set is type-erased so operations with different result
//! types share one cache.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::bulkhead::Bulkhead;
use crate::config::watch::ConfigWatch;
use crate::config::{precedence_paths, ConfigSource, ConfigValue, FromConfigValue, OverrideTable, PolicyType, Property};
use crate::error::DefinitionError;
use crate::kind::KindSet;
use crate::metrics::{BundleShape, MetricsBundle};
use crate::operation::{OperationDefinition, OperationKey, SignatureDescriptor};
use crate::policy::fallback::FallbackBinding;
use crate::retry::RetrySchedule;
use crate::timeout::TimeoutGuard;

/// A circuit breaker together with the kind filter that scores outcomes against it.
#[derive(Debug)]
pub(crate) struct BreakerGuard {
    pub breaker: CircuitBreaker,
    pub fail_on: KindSet,
}

/// The live, type-erased policy machinery for one operation.
///
/// Built once and cached; every execution of the operation drives this same set, so
/// breaker windows and bulkhead occupancy are shared across calls and callers.
pub(crate) struct PolicySet {
    pub key: OperationKey,
    pub signature: SignatureDescriptor,
    pub asynchronous: bool,
    pub bulkhead: Option<Bulkhead>,
    pub breaker: Option<BreakerGuard>,
    pub timeout: Option<TimeoutGuard>,
    pub retry: Option<RetrySchedule>,
    pub metrics: MetricsBundle,
    fallback: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySet")
            .field("key", &self.key)
            .field("signature", &self.signature)
            .field("asynchronous", &self.asynchronous)
            .finish_non_exhaustive()
    }
}

impl PolicySet {
    /// Recovers the typed fallback binding.
    ///
    /// Fails when the caller's type parameters differ from those the set was
    /// resolved with, which means two definitions with the same derived key bind
    /// different error types.
    pub fn fallback<T, E>(&self) -> Result<&FallbackBinding<T, E>, DefinitionError>
    where
        T: 'static,
        E: std::error::Error + 'static,
    {
        self.fallback
            .downcast_ref::<FallbackBinding<T, E>>()
            .ok_or_else(|| DefinitionError::SignatureMismatch {
                operation: self.key.clone(),
                existing: self.signature.to_string(),
            })
    }
}

/// Reads the startup value for one property, most specific path first, and
/// registers a change watch on every path so later updates reach the override
/// table.
fn resolved<V: FromConfigValue>(
    source: &dyn ConfigSource,
    watch: &ConfigWatch,
    key: &OperationKey,
    policy: PolicyType,
    property: &'static str,
    declared: V,
) -> Property<V> {
    let paths = precedence_paths(key.command(), key.group(), policy, property);
    for path in &paths {
        watch.watch(source, path);
    }

    let value = paths
        .iter()
        .find_map(|path| {
            let raw = source.get(path)?;
            V::from_value(&ConfigValue::parse(&raw)?)
        })
        .unwrap_or(declared);

    Property::new(value, paths)
}

fn invalid(key: &OperationKey, policy: PolicyType, property: &str, reason: impl Into<String>) -> DefinitionError {
    DefinitionError::InvalidPolicyValue {
        operation: key.clone(),
        property: format!("{policy}.{property}"),
        reason: reason.into(),
    }
}

/// Validates `definition` and builds its policy set.
pub(crate) fn resolve<T, E>(
    definition: &OperationDefinition<T, E>,
    source: &dyn ConfigSource,
    watch: &ConfigWatch,
    overrides: &OverrideTable,
) -> Result<PolicySet, DefinitionError>
where
    T: 'static,
    E: std::error::Error + 'static,
{
    let key = definition.operation_key();

    if TypeId::of::<T>() != definition.signature.result_type {
        return Err(DefinitionError::ResultType {
            operation: key,
            expected: definition.signature.result_type_name,
            found: std::any::type_name::<T>(),
        });
    }
    if definition.asynchronous && !definition.signature.returns_future {
        return Err(DefinitionError::AsyncReturnType(key));
    }
    if definition.fallback_handler.is_some() && definition.fallback_method.is_some() {
        return Err(DefinitionError::ConflictingFallback(key));
    }

    let bulkhead = definition
        .bulkhead
        .effective()
        .map(|(policy, _)| {
            if policy.max_concurrent == 0 {
                return Err(invalid(&key, PolicyType::Bulkhead, "value", "must be at least 1"));
            }
            let max_concurrent = resolved(source, watch, &key, PolicyType::Bulkhead, "value", policy.max_concurrent);
            let queue_size = resolved(
                source,
                watch,
                &key,
                PolicyType::Bulkhead,
                "waiting-task-queue",
                policy.waiting_queue_size,
            );
            Ok(Bulkhead::new(overrides, max_concurrent, queue_size, definition.asynchronous))
        })
        .transpose()?;

    let breaker = definition
        .circuit_breaker
        .effective()
        .map(|(policy, _)| {
            if !(policy.failure_ratio > 0.0 && policy.failure_ratio <= 1.0) {
                return Err(invalid(
                    &key,
                    PolicyType::CircuitBreaker,
                    "failure-ratio",
                    "must be within (0, 1]",
                ));
            }
            if policy.request_volume_threshold == 0 {
                return Err(invalid(
                    &key,
                    PolicyType::CircuitBreaker,
                    "request-volume-threshold",
                    "must be at least 1",
                ));
            }
            if policy.success_threshold == 0 {
                return Err(invalid(
                    &key,
                    PolicyType::CircuitBreaker,
                    "success-threshold",
                    "must be at least 1",
                ));
            }

            let breaker = CircuitBreaker::new(
                resolved(source, watch, &key, PolicyType::CircuitBreaker, "delay", policy.delay),
                resolved(
                    source,
                    watch,
                    &key,
                    PolicyType::CircuitBreaker,
                    "request-volume-threshold",
                    policy.request_volume_threshold,
                ),
                resolved(
                    source,
                    watch,
                    &key,
                    PolicyType::CircuitBreaker,
                    "failure-ratio",
                    policy.failure_ratio,
                ),
                resolved(
                    source,
                    watch,
                    &key,
                    PolicyType::CircuitBreaker,
                    "success-threshold",
                    policy.success_threshold,
                ),
            );
            Ok(BreakerGuard {
                breaker,
                fail_on: policy.fail_on.clone(),
            })
        })
        .transpose()?;

    let timeout = definition.timeout.effective().map(|(policy, _)| {
        TimeoutGuard::new(resolved(source, watch, &key, PolicyType::Timeout, "value", policy.value))
    });

    let retry = definition.retry.effective().map(|(policy, _)| {
        RetrySchedule::new(
            resolved(source, watch, &key, PolicyType::Retry, "max-retries", policy.max_retries),
            resolved(source, watch, &key, PolicyType::Retry, "delay", policy.delay),
            resolved(source, watch, &key, PolicyType::Retry, "jitter", policy.jitter),
            policy.retry_on.clone(),
            policy.abort_on.clone(),
        )
    });

    let binding: FallbackBinding<T, E> = match (&definition.fallback_handler, &definition.fallback_method) {
        (Some(handler), None) => FallbackBinding::Handler(Arc::clone(handler)),
        (None, Some(method)) => FallbackBinding::Method(method.clone()),
        (None, None) => FallbackBinding::None,
        (Some(_), Some(_)) => unreachable!("rejected above"),
    };

    let metrics = MetricsBundle::new(
        &key,
        &BundleShape {
            bulkhead: bulkhead.is_some(),
            breaker: breaker.is_some(),
            timeout: timeout.is_some(),
            retry: retry.is_some(),
            fallback: !matches!(binding, FallbackBinding::None),
        },
    );

    Ok(PolicySet {
        key,
        signature: definition.signature.clone(),
        asynchronous: definition.asynchronous,
        bulkhead,
        breaker,
        timeout,
        retry,
        metrics,
        fallback: Arc::new(binding),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{MapConfigSource, NoopConfigSource};
    use crate::policy::{BulkheadPolicy, CircuitBreakerPolicy, RetryPolicy, TimeoutPolicy};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[derive(Debug, thiserror::Error)]
    #[error("other boom")]
    struct OtherBoom;

    fn definition() -> OperationDefinition<u32, Boom> {
        OperationDefinition::new(SignatureDescriptor::of::<u32>("Svc", "op"))
    }

    fn resolve_with_source<T: 'static, E: std::error::Error + 'static>(
        definition: &OperationDefinition<T, E>,
        source: &dyn ConfigSource,
    ) -> Result<PolicySet, DefinitionError> {
        let watch = ConfigWatch::new(source);
        let overrides = OverrideTable::default();
        resolve(definition, source, &watch, &overrides)
    }

    fn try_resolve<T: 'static, E: std::error::Error + 'static>(
        definition: &OperationDefinition<T, E>,
    ) -> Result<PolicySet, DefinitionError> {
        resolve_with_source(definition, &NoopConfigSource)
    }

    #[test]
    fn plain_definition_resolves_with_no_policies() {
        let set = try_resolve(&definition()).unwrap();
        assert!(set.bulkhead.is_none());
        assert!(set.breaker.is_none());
        assert!(set.timeout.is_none());
        assert!(set.retry.is_none());
        assert!(set.metrics.fallback.is_none());
        assert!(matches!(set.fallback::<u32, Boom>().unwrap(), FallbackBinding::None));
    }

    #[test]
    fn declared_policies_produce_their_machinery() {
        let definition = definition()
            .bulkhead(BulkheadPolicy::new(2))
            .circuit_breaker(CircuitBreakerPolicy::new())
            .timeout(TimeoutPolicy::new(Duration::from_secs(1)))
            .retry(RetryPolicy::new(2))
            .fallback_method("zero", |_| Ok(0));

        let set = try_resolve(&definition).unwrap();
        assert!(set.bulkhead.is_some());
        assert!(set.breaker.is_some());
        assert!(set.timeout.is_some());
        assert!(set.retry.is_some());
        assert!(set.metrics.fallback.is_some());
        assert!(matches!(set.fallback::<u32, Boom>().unwrap(), FallbackBinding::Method(_)));
    }

    #[test]
    fn mismatched_result_type_is_rejected() {
        let definition = OperationDefinition::<u32, Boom>::new(SignatureDescriptor::of::<String>("Svc", "op"));
        assert!(matches!(
            try_resolve(&definition),
            Err(DefinitionError::ResultType { expected, .. }) if expected.contains("String")
        ));
    }

    #[test]
    fn asynchronous_requires_a_future_signature() {
        let definition = definition().asynchronous();
        assert!(matches!(try_resolve(&definition), Err(DefinitionError::AsyncReturnType(_))));

        let definition = OperationDefinition::<u32, Boom>::new(
            SignatureDescriptor::of::<u32>("Svc", "op").returning_future(),
        )
        .asynchronous();
        assert!(try_resolve(&definition).is_ok());
    }

    #[test]
    fn conflicting_fallback_declarations_are_rejected() {
        let definition = definition()
            .fallback_handler(|_: &crate::error::FaultError<Boom>| Ok(0_u32))
            .fallback_method("zero", |_| Ok(0));
        assert!(matches!(
            try_resolve(&definition),
            Err(DefinitionError::ConflictingFallback(_))
        ));
    }

    #[test]
    fn out_of_range_policy_values_are_rejected() {
        let ratio = definition().circuit_breaker(CircuitBreakerPolicy::new().failure_ratio(1.5));
        assert!(matches!(
            try_resolve(&ratio),
            Err(DefinitionError::InvalidPolicyValue { property, .. }) if property == "circuit-breaker.failure-ratio"
        ));

        let ratio_floor = definition().circuit_breaker(CircuitBreakerPolicy::new().failure_ratio(0.0));
        assert!(try_resolve(&ratio_floor).is_err());

        let full_ratio = definition().circuit_breaker(CircuitBreakerPolicy::new().failure_ratio(1.0));
        assert!(try_resolve(&full_ratio).is_ok());

        let volume = definition().circuit_breaker(CircuitBreakerPolicy::new().request_volume_threshold(0));
        assert!(try_resolve(&volume).is_err());

        let successes = definition().circuit_breaker(CircuitBreakerPolicy::new().success_threshold(0));
        assert!(try_resolve(&successes).is_err());

        let bulkhead = definition().bulkhead(BulkheadPolicy::new(0));
        assert!(matches!(
            try_resolve(&bulkhead),
            Err(DefinitionError::InvalidPolicyValue { property, .. }) if property == "bulkhead.value"
        ));
    }

    #[test]
    fn startup_configuration_overrides_declared_values() {
        let source = MapConfigSource::from_pairs([("fault-tolerance.Svc.timeout.value", "PT2S")]);
        let definition = definition().timeout(TimeoutPolicy::new(Duration::from_millis(100)));

        let set = resolve_with_source(&definition, &source).unwrap();
        let overrides = OverrideTable::default();

        // The guard honors the configured deadline rather than the declared one.
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            tokio::time::pause();
            let guard = set.timeout.as_ref().unwrap();
            let slow = async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                1_u32
            };
            assert_eq!(guard.run(&overrides, slow).await, Ok(1));
        });
    }

    #[test]
    fn more_specific_startup_path_wins() {
        let source = MapConfigSource::from_pairs([
            ("fault-tolerance.retry.max-retries", "9"),
            ("fault-tolerance.Svc-op.Svc.retry.max-retries", "0"),
        ]);
        let definition = definition().retry(RetryPolicy::new(3));

        let set = resolve_with_source(&definition, &source).unwrap();
        let overrides = OverrideTable::default();
        let schedule = set.retry.as_ref().unwrap();

        assert_eq!(
            schedule.decide(&overrides, 1, crate::kind::FaultKind::UNCLASSIFIED),
            crate::retry::Decision::GiveUp
        );
    }

    #[test]
    fn fallback_downcast_with_foreign_error_type_is_a_mismatch() {
        let set = try_resolve(&definition()).unwrap();
        assert!(matches!(
            set.fallback::<u32, OtherBoom>(),
            Err(DefinitionError::SignatureMismatch { .. })
        ));
    }
}
