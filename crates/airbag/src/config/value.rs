// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Prefix of every configuration path owned by the engine.
pub const SERVICE_NAME: &str = "fault-tolerance";

/// The policy a configuration path or metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PolicyType {
    /// Execution-mode declaration.
    Asynchronous,
    /// Concurrency/queue admission control.
    Bulkhead,
    /// Rolling-window failure detection.
    CircuitBreaker,
    /// Deadline enforcement.
    Timeout,
    /// Bounded re-invocation.
    Retry,
    /// Substitute-result dispatch.
    Fallback,
    /// Whole-pipeline accounting not tied to a single policy.
    Invocation,
}

impl PolicyType {
    /// Returns the path segment used for this policy in configuration keys.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Asynchronous => "asynchronous",
            Self::Bulkhead => "bulkhead",
            Self::CircuitBreaker => "circuit-breaker",
            Self::Timeout => "timeout",
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::Invocation => "invocation",
        }
    }
}

impl Display for PolicyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// A typed configuration value.
///
/// Raw values arrive from the configuration source as strings; [`ConfigValue::parse`]
/// tries integer, float, boolean, and duration in that order, the same heuristic the
/// path-addressed property model has always used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigValue {
    /// A whole number.
    Int(i64),
    /// A fractional number.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// A span of time. Accepts ISO-8601 (`PT3S`) and friendly (`3s`, `250ms`) forms.
    Duration(Duration),
}

impl ConfigValue {
    /// Parses a raw string into a typed value, or `None` when no representation fits.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();

        if let Ok(value) = raw.parse::<i64>() {
            return Some(Self::Int(value));
        }
        if let Ok(value) = raw.parse::<f64>() {
            return Some(Self::Float(value));
        }
        if let Ok(value) = raw.parse::<bool>() {
            return Some(Self::Bool(value));
        }
        if let Ok(span) = raw.parse::<jiff::SignedDuration>() {
            if let Ok(duration) = Duration::try_from(span) {
                return Some(Self::Duration(duration));
            }
        }

        None
    }
}

/// Conversion from a parsed [`ConfigValue`] into a policy property type.
///
/// Conversions are strict: a duration property is never satisfied by a bare number,
/// and vice versa, so a mistyped override is dropped rather than misread.
pub(crate) trait FromConfigValue: Copy + Sized {
    fn from_value(value: &ConfigValue) -> Option<Self>;
}

impl FromConfigValue for u32 {
    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int(i) => Self::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl FromConfigValue for f64 {
    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Float(f) => Some(*f),
            #[expect(clippy::cast_precision_loss, reason = "config thresholds are small")]
            ConfigValue::Int(i) => Some(*i as Self),
            _ => None,
        }
    }
}

impl FromConfigValue for bool {
    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromConfigValue for Duration {
    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Duration(d) => Some(*d),
            _ => None,
        }
    }
}

/// Renders the configuration paths for one property, most specific first:
/// command+group scoped, group scoped, then global.
///
/// First present value wins when these are looked up in order.
pub(crate) fn precedence_paths(command: &str, group: &str, policy: PolicyType, property: &'static str) -> [String; 3] {
    [
        format!("{SERVICE_NAME}.{command}.{group}.{}.{property}", policy.key()),
        format!("{SERVICE_NAME}.{group}.{}.{property}", policy.key()),
        format!("{SERVICE_NAME}.{}.{property}", policy.key()),
    ]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("42", ConfigValue::Int(42))]
    #[case("-7", ConfigValue::Int(-7))]
    #[case("0.5", ConfigValue::Float(0.5))]
    #[case("true", ConfigValue::Bool(true))]
    #[case("false", ConfigValue::Bool(false))]
    #[case("PT3S", ConfigValue::Duration(Duration::from_secs(3)))]
    #[case("250ms", ConfigValue::Duration(Duration::from_millis(250)))]
    #[case(" 42 ", ConfigValue::Int(42))]
    fn parse_typed_values(#[case] raw: &str, #[case] expected: ConfigValue) {
        assert_eq!(ConfigValue::parse(raw), Some(expected));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(ConfigValue::parse("not-a-value"), None);
        assert_eq!(ConfigValue::parse(""), None);
    }

    #[test]
    fn conversions_are_strict() {
        assert_eq!(u32::from_value(&ConfigValue::Int(5)), Some(5));
        assert_eq!(u32::from_value(&ConfigValue::Int(-5)), None);
        assert_eq!(u32::from_value(&ConfigValue::Float(5.0)), None);
        assert_eq!(f64::from_value(&ConfigValue::Int(5)), Some(5.0));
        assert_eq!(Duration::from_value(&ConfigValue::Int(5)), None);
        assert_eq!(
            Duration::from_value(&ConfigValue::Duration(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn paths_follow_the_grammar() {
        let paths = precedence_paths("Svc-find", "Svc", PolicyType::CircuitBreaker, "delay");
        assert_eq!(paths[0], "fault-tolerance.Svc-find.Svc.circuit-breaker.delay");
        assert_eq!(paths[1], "fault-tolerance.Svc.circuit-breaker.delay");
        assert_eq!(paths[2], "fault-tolerance.circuit-breaker.delay");
    }
}
