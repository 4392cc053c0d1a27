// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Operation identity: keys, signature descriptors, and the per-operation
//! definition callers hand to the engine.

use std::any::TypeId;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::error::FaultError;
use crate::policy::fallback::{FallbackHandler, FallbackMethod};
use crate::policy::{BulkheadPolicy, CircuitBreakerPolicy, PolicyDeclaration, RetryPolicy, Scope, TimeoutPolicy};

/// Identity of one guarded operation: the command it names and the group it belongs
/// to (for shared bulkhead/circuit accounting).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    group: String,
    command: String,
}

impl OperationKey {
    /// Creates a key from explicit group and command names.
    #[must_use]
    pub fn new(group: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            command: command.into(),
        }
    }

    /// The command key.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The group key.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl Display for OperationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.command)
    }
}

/// Value-comparable descriptor of a guarded target's signature.
///
/// Built once at registration; every later signature check is a comparison against
/// this descriptor rather than per-call introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureDescriptor {
    pub(crate) type_name: &'static str,
    pub(crate) method_name: &'static str,
    pub(crate) result_type: TypeId,
    pub(crate) result_type_name: &'static str,
    pub(crate) returns_future: bool,
}

impl SignatureDescriptor {
    /// Describes a method on `type_name` producing results of type `R`.
    #[must_use]
    pub fn of<R: 'static>(type_name: &'static str, method_name: &'static str) -> Self {
        Self {
            type_name,
            method_name,
            result_type: TypeId::of::<R>(),
            result_type_name: std::any::type_name::<R>(),
            returns_future: false,
        }
    }

    /// Marks the declared return type as future-like. Required for operations
    /// declared asynchronous.
    #[must_use]
    pub fn returning_future(mut self) -> Self {
        self.returns_future = true;
        self
    }
}

impl Display for SignatureDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{} -> {}", self.type_name, self.method_name, self.result_type_name)
    }
}

/// Everything the binding layer declares about one guarded operation.
///
/// `T` is the operation's result type and `E` its error type. The definition is
/// resolved into a cached policy set on first execution; later executions only
/// verify that the definition matches what was cached.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use airbag::{OperationDefinition, RetryPolicy, SignatureDescriptor, TimeoutPolicy};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("lookup failed")]
/// struct LookupError;
/// impl airbag::Fault for LookupError {}
///
/// let definition = OperationDefinition::<String, LookupError>::new(
///     SignatureDescriptor::of::<String>("UserDirectory", "display_name"),
/// )
/// .timeout(TimeoutPolicy::new(Duration::from_millis(200)))
/// .retry(RetryPolicy::new(2).delay(Duration::from_millis(50)));
/// ```
pub struct OperationDefinition<T, E>
where
    E: std::error::Error + 'static,
{
    pub(crate) signature: SignatureDescriptor,
    pub(crate) command_key: Option<String>,
    pub(crate) group_key: Option<String>,
    pub(crate) asynchronous: bool,
    pub(crate) bulkhead: PolicyDeclaration<BulkheadPolicy>,
    pub(crate) timeout: PolicyDeclaration<TimeoutPolicy>,
    pub(crate) retry: PolicyDeclaration<RetryPolicy>,
    pub(crate) circuit_breaker: PolicyDeclaration<CircuitBreakerPolicy>,
    pub(crate) fallback_handler: Option<Arc<dyn FallbackHandler<T, E>>>,
    pub(crate) fallback_method: Option<FallbackMethod<T, E>>,
}

impl<T, E> std::fmt::Debug for OperationDefinition<T, E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDefinition")
            .field("signature", &self.signature)
            .field("asynchronous", &self.asynchronous)
            .finish_non_exhaustive()
    }
}

impl<T, E> OperationDefinition<T, E>
where
    E: std::error::Error + 'static,
{
    /// Starts a definition for the described target with no policies declared.
    #[must_use]
    pub fn new(signature: SignatureDescriptor) -> Self {
        Self {
            signature,
            command_key: None,
            group_key: None,
            asynchronous: false,
            bulkhead: PolicyDeclaration::default(),
            timeout: PolicyDeclaration::default(),
            retry: PolicyDeclaration::default(),
            circuit_breaker: PolicyDeclaration::default(),
            fallback_handler: None,
            fallback_method: None,
        }
    }

    /// Overrides the derived command key.
    #[must_use]
    pub fn command_key(mut self, key: impl Into<String>) -> Self {
        self.command_key = Some(key.into());
        self
    }

    /// Overrides the derived group key.
    #[must_use]
    pub fn group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    /// Declares the operation asynchronous. Its signature must return a future-like
    /// type, and its bulkhead gains a waiting queue.
    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Declares a method-scoped bulkhead.
    #[must_use]
    pub fn bulkhead(mut self, policy: BulkheadPolicy) -> Self {
        self.bulkhead.method = Some(policy);
        self
    }

    /// Declares a type-scoped bulkhead, inherited by every method of the type.
    #[must_use]
    pub fn type_bulkhead(mut self, policy: BulkheadPolicy) -> Self {
        self.bulkhead.type_level = Some(policy);
        self
    }

    /// Declares a method-scoped timeout.
    #[must_use]
    pub fn timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout.method = Some(policy);
        self
    }

    /// Declares a type-scoped timeout.
    #[must_use]
    pub fn type_timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout.type_level = Some(policy);
        self
    }

    /// Declares a method-scoped retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry.method = Some(policy);
        self
    }

    /// Declares a type-scoped retry policy.
    #[must_use]
    pub fn type_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry.type_level = Some(policy);
        self
    }

    /// Declares a method-scoped circuit breaker.
    #[must_use]
    pub fn circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker.method = Some(policy);
        self
    }

    /// Declares a type-scoped circuit breaker.
    #[must_use]
    pub fn type_circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker.type_level = Some(policy);
        self
    }

    /// Binds a fallback handler. Mutually exclusive with
    /// [`fallback_method`][Self::fallback_method]; declaring both is a definition
    /// error raised at resolution.
    #[must_use]
    pub fn fallback_handler(mut self, handler: impl FallbackHandler<T, E> + 'static) -> Self {
        self.fallback_handler = Some(Arc::new(handler));
        self
    }

    /// Binds a named fallback method.
    #[must_use]
    pub fn fallback_method(
        mut self,
        name: &'static str,
        call: impl Fn(&FaultError<E>) -> Result<T, E> + Send + Sync + 'static,
    ) -> Self {
        self.fallback_method = Some(FallbackMethod::new(name, call));
        self
    }

    /// Derives the operation key.
    ///
    /// The command defaults to `<Type>-<method>` and the group to the type name,
    /// except that a method-scoped bulkhead narrows the default group to
    /// `<Type>-<method>`; explicit keys override both.
    #[must_use]
    pub fn operation_key(&self) -> OperationKey {
        let command = self
            .command_key
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.signature.type_name, self.signature.method_name));

        let group = self.group_key.clone().unwrap_or_else(|| {
            if self.bulkhead.declared_at(Scope::Method) {
                format!("{}-{}", self.signature.type_name, self.signature.method_name)
            } else {
                self.signature.type_name.to_owned()
            }
        });

        OperationKey { group, command }
    }
}
