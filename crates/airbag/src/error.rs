// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::kind::{Fault, FaultKind};
use crate::operation::OperationKey;

/// A malformed policy declaration.
///
/// Definition errors are fatal for the operation: they are raised once, when the
/// operation is first resolved, and are never routed through fallback or retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DefinitionError {
    /// The operation is declared asynchronous but its signature does not return a
    /// future-like type.
    #[error("asynchronous operation '{0}' must declare a future-like return type")]
    AsyncReturnType(OperationKey),

    /// Both a fallback handler and a fallback method were declared.
    #[error("operation '{0}' declares both a fallback handler and a fallback method; pick one")]
    ConflictingFallback(OperationKey),

    /// The operation's actual result type does not match the declared signature.
    #[error("operation '{operation}' resolves results of type '{found}' but its signature declares '{expected}'")]
    ResultType {
        /// The operation whose declaration is invalid.
        operation: OperationKey,
        /// The result type named by the signature descriptor.
        expected: &'static str,
        /// The result type the definition actually produces.
        found: &'static str,
    },

    /// A definition was registered under a key that is already cached with a
    /// different target signature.
    #[error("operation '{operation}' is already registered with signature '{existing}'")]
    SignatureMismatch {
        /// The colliding operation key.
        operation: OperationKey,
        /// Rendering of the signature already cached for the key.
        existing: String,
    },

    /// A policy property holds a value outside its valid range.
    #[error("invalid value for '{property}' on operation '{operation}': {reason}")]
    InvalidPolicyValue {
        /// The operation whose declaration is invalid.
        operation: OperationKey,
        /// The offending property, as `<policy>.<property>`.
        property: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// The failure surface of a guarded call.
///
/// `E` is the application's own error type; it appears in [`Execution`][Self::Execution]
/// when the raw call fails and in [`FallbackFailed`][Self::FallbackFailed] when the
/// fallback itself fails.
#[derive(Debug)]
#[non_exhaustive]
pub enum FaultError<E: std::error::Error + 'static> {
    /// The operation's policy declaration is invalid. Raised at resolution time,
    /// before any call executes, and never routed through fallback.
    Definition(DefinitionError),

    /// The circuit breaker is open; the guarded call was not invoked.
    CircuitOpen {
        /// The operation that failed fast.
        operation: OperationKey,
    },

    /// Bulkhead capacity (and, for asynchronous operations, queue capacity) is
    /// exhausted; the guarded call was not invoked.
    BulkheadRejected {
        /// The operation that was rejected.
        operation: OperationKey,
    },

    /// The guarded call exceeded its deadline and was cancelled.
    Timeout {
        /// The deadline that expired.
        limit: Duration,
    },

    /// The guarded call itself failed.
    Execution(E),

    /// The fallback was invoked and failed in turn. The original failure is
    /// preserved in `cause`; nothing is silently swallowed.
    FallbackFailed {
        /// The fallback's own failure.
        error: E,
        /// The terminal failure that triggered the fallback.
        cause: Box<FaultError<E>>,
    },
}

// Not derived: interpolating the boxed `cause` through a derived message turns
// the `Display` obligation on `FaultError<E>` recursive (E0275) at generic
// call sites.
impl<E: std::error::Error + 'static> std::fmt::Display for FaultError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Definition(error) => std::fmt::Display::fmt(error, f),
            Self::CircuitOpen { operation } => {
                write!(f, "circuit breaker is open for operation '{operation}'")
            }
            Self::BulkheadRejected { operation } => {
                write!(f, "bulkhead capacity exceeded for operation '{operation}'")
            }
            Self::Timeout { limit } => write!(f, "guarded call timed out after {limit:?}"),
            Self::Execution(_) => f.write_str("guarded call failed"),
            Self::FallbackFailed { cause, .. } => {
                write!(f, "fallback failed (original failure: {cause})")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FaultError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Definition(error) => error.source(),
            Self::Execution(error) | Self::FallbackFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl<E: std::error::Error + 'static> From<DefinitionError> for FaultError<E> {
    fn from(error: DefinitionError) -> Self {
        Self::Definition(error)
    }
}

impl<E> FaultError<E>
where
    E: Fault + std::error::Error + 'static,
{
    /// Returns the classification kind of this failure, if it has one.
    ///
    /// Circuit-open and bulkhead rejections are engine verdicts, not call outcomes,
    /// and carry no kind; they are never matched against `retry_on`/`abort_on`.
    #[must_use]
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::Timeout { .. } => Some(FaultKind::TIMEOUT),
            Self::Execution(error) => Some(error.kind()),
            _ => None,
        }
    }
}
