// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt::{Display, Formatter};

/// A lightweight classification tag for application failures.
///
/// Fault-tolerance policies never inspect application error types directly. Instead,
/// every error reports a `FaultKind` through the [`Fault`] trait, and policies match
/// those kinds against [`KindSet`] filters (`fail_on`, `retry_on`, `abort_on`).
///
/// Kinds are compared by name, so two independently created kinds with the same name
/// are equal.
///
/// # Examples
///
/// ```rust
/// use airbag::FaultKind;
///
/// const CONNECTION_RESET: FaultKind = FaultKind::new("connection_reset");
///
/// assert_eq!(CONNECTION_RESET, FaultKind::new("connection_reset"));
/// assert_ne!(CONNECTION_RESET, FaultKind::TIMEOUT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultKind(&'static str);

impl FaultKind {
    /// The kind attached to deadline expirations produced by the timeout guard.
    ///
    /// Listing this kind in `abort_on` stops retries of timed-out attempts.
    pub const TIMEOUT: Self = Self("airbag.timeout");

    /// The kind reported by errors that do not classify themselves.
    pub const UNCLASSIFIED: Self = Self("airbag.unclassified");

    /// Creates a new kind with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the name of this kind.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl Display for FaultKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Implemented by application error types to classify their failures.
///
/// This plays the role that exception-class matching plays in annotation-driven
/// fault-tolerance frameworks: policies hold sets of kinds rather than lists of
/// concrete error types.
///
/// # Examples
///
/// ```rust
/// use airbag::{Fault, FaultKind};
///
/// #[derive(Debug, thiserror::Error)]
/// enum StoreError {
///     #[error("connection lost")]
///     ConnectionLost,
///     #[error("no such row")]
///     NotFound,
/// }
///
/// impl Fault for StoreError {
///     fn kind(&self) -> FaultKind {
///         match self {
///             Self::ConnectionLost => FaultKind::new("connection_lost"),
///             Self::NotFound => FaultKind::new("not_found"),
///         }
///     }
/// }
/// ```
pub trait Fault {
    /// Returns the kind of this failure.
    fn kind(&self) -> FaultKind {
        FaultKind::UNCLASSIFIED
    }
}

/// A set of [`FaultKind`] values used by policy filters.
///
/// `fail_on` and `retry_on` default to [`KindSet::Any`]; `abort_on` defaults to
/// [`KindSet::Empty`]. When a kind appears in both `retry_on` and `abort_on`,
/// abort wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KindSet {
    /// Matches every kind.
    #[default]
    Any,

    /// Matches no kind.
    Empty,

    /// Matches exactly the listed kinds.
    Of(Cow<'static, [FaultKind]>),
}

impl KindSet {
    /// Creates a set matching exactly the given kinds.
    #[must_use]
    pub const fn of(kinds: &'static [FaultKind]) -> Self {
        Self::Of(Cow::Borrowed(kinds))
    }

    /// Returns whether the set contains the given kind.
    #[must_use]
    pub fn contains(&self, kind: FaultKind) -> bool {
        match self {
            Self::Any => true,
            Self::Empty => false,
            Self::Of(kinds) => kinds.contains(&kind),
        }
    }
}

impl FromIterator<FaultKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = FaultKind>>(iter: I) -> Self {
        Self::Of(Cow::Owned(iter.into_iter().collect()))
    }
}
