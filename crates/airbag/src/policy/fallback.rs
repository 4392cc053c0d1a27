// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fallback bindings: a polymorphic handler, a designated method, or nothing.

use std::sync::Arc;

use crate::error::FaultError;

/// A polymorphic fallback: invoked with the terminal failure, produces a substitute
/// result in its place.
///
/// Handlers are bound once at resolution time and reused for every dispatch of the
/// operation; implementations must therefore be stateless or internally synchronized.
pub trait FallbackHandler<T, E>: Send + Sync
where
    E: std::error::Error + 'static,
{
    /// Produces the substitute result for `cause`.
    ///
    /// # Errors
    ///
    /// A returned error is wrapped as [`FaultError::FallbackFailed`]; the original
    /// failure is preserved alongside it.
    fn handle(&self, cause: &FaultError<E>) -> Result<T, E>;
}

impl<T, E, F> FallbackHandler<T, E> for F
where
    E: std::error::Error + 'static,
    F: Fn(&FaultError<E>) -> Result<T, E> + Send + Sync,
{
    fn handle(&self, cause: &FaultError<E>) -> Result<T, E> {
        self(cause)
    }
}

/// A fallback method designated by name on the guarded type.
///
/// The callable stands in for the reflective method reference the declarative layer
/// located; it is captured once and never re-resolved per call.
pub struct FallbackMethod<T, E>
where
    E: std::error::Error + 'static,
{
    name: &'static str,
    #[expect(clippy::type_complexity, reason = "one alias would name this type exactly once")]
    call: Arc<dyn Fn(&FaultError<E>) -> Result<T, E> + Send + Sync>,
}

// Not derived: a derived `Clone` would demand `T: Clone` and `E: Clone`.
impl<T, E> Clone for FallbackMethod<T, E>
where
    E: std::error::Error + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            call: Arc::clone(&self.call),
        }
    }
}

impl<T, E> std::fmt::Debug for FallbackMethod<T, E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackMethod").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<T, E> FallbackMethod<T, E>
where
    E: std::error::Error + 'static,
{
    /// Binds a fallback method with the given name.
    pub fn new(name: &'static str, call: impl Fn(&FaultError<E>) -> Result<T, E> + Send + Sync + 'static) -> Self {
        Self {
            name,
            call: Arc::new(call),
        }
    }

    /// The declared method name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn invoke(&self, cause: &FaultError<E>) -> Result<T, E> {
        (self.call)(cause)
    }
}

/// The resolved fallback binding for one operation: exactly one variant holds.
pub(crate) enum FallbackBinding<T, E>
where
    E: std::error::Error + 'static,
{
    /// No fallback; the original failure propagates.
    None,
    /// Dispatch to a polymorphic handler.
    Handler(Arc<dyn FallbackHandler<T, E>>),
    /// Dispatch to the designated method.
    Method(FallbackMethod<T, E>),
}

impl<T, E> std::fmt::Debug for FallbackBinding<T, E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("FallbackBinding::None"),
            Self::Handler(_) => f.write_str("FallbackBinding::Handler"),
            Self::Method(method) => write!(f, "FallbackBinding::Method({})", method.name),
        }
    }
}

impl<T, E> FallbackBinding<T, E>
where
    E: std::error::Error + 'static,
{
    /// Dispatches the terminal failure through this binding.
    ///
    /// Returns `Ok(None)` when no fallback is bound, so the caller propagates the
    /// original failure unchanged.
    pub fn dispatch(&self, cause: &FaultError<E>) -> Result<Option<T>, E> {
        match self {
            Self::None => Ok(None),
            Self::Handler(handler) => handler.handle(cause).map(Some),
            Self::Method(method) => method.invoke(cause).map(Some),
        }
    }
}
