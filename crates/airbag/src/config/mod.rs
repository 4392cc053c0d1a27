// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Path-addressed configuration: typed property values, the source boundary, and
//! the bounded hot-reload pipeline.
//!
//! Configuration paths follow the grammar
//! `fault-tolerance.<commandKey>.<groupKey>.<policyType>.<propertyName>`, with the
//! command and group segments optional. Lookups try the command+group scoped path,
//! then the group scoped path, then the global path; the first present value wins.

mod source;
mod value;
pub(crate) mod watch;

use dashmap::DashMap;

pub use source::{ConfigListener, ConfigSource, MapConfigSource, NoopConfigSource};
pub use value::{ConfigValue, PolicyType, SERVICE_NAME};
pub(crate) use value::{precedence_paths, FromConfigValue};

/// Live property overrides applied by the configuration drain.
///
/// Policy objects read this table on every execution instead of caching effective
/// values inside the resolved policy set, which is what makes hot reload possible
/// without invalidating cached per-operation state.
#[derive(Debug, Default)]
pub(crate) struct OverrideTable {
    values: DashMap<String, ConfigValue>,
}

impl OverrideTable {
    pub fn insert(&self, path: String, value: ConfigValue) {
        self.values.insert(path, value);
    }

    /// Walks `paths` in precedence order and returns the first present value that
    /// converts to `V`.
    pub fn lookup<V: FromConfigValue>(&self, paths: &[String]) -> Option<V> {
        paths
            .iter()
            .find_map(|path| self.values.get(path).and_then(|value| V::from_value(&value)))
    }
}

/// One resolved policy property: the value resolution produced, plus the
/// configuration paths that may override it at call time.
#[derive(Debug, Clone)]
pub(crate) struct Property<V> {
    default: V,
    paths: [String; 3],
}

impl<V: FromConfigValue> Property<V> {
    pub fn new(default: V, paths: [String; 3]) -> Self {
        Self { default, paths }
    }

    /// The effective value right now: the most specific live override, or the value
    /// resolved at registration time.
    pub fn current(&self, overrides: &OverrideTable) -> V {
        overrides.lookup(&self.paths).unwrap_or(self.default)
    }
}
