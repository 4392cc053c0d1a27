// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use dashmap::DashMap;

/// Callback invoked by a configuration source when a subscribed path changes.
///
/// The arguments are the updated path and its new raw value.
pub type ConfigListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Boundary to the configuration backend.
///
/// The engine reads raw string values and subscribes for change notifications; it
/// owns no knowledge of where values come from. Implementations must be cheap to
/// call: `get` runs during policy resolution and listeners fire on the backend's
/// notification thread.
pub trait ConfigSource: Send + Sync + 'static {
    /// Returns the raw value at `path`, if present.
    fn get(&self, path: &str) -> Option<String>;

    /// Registers a listener for changes to `path`.
    ///
    /// Sources without change notification can ignore this; the default does.
    fn subscribe(&self, path: &str, listener: ConfigListener) {
        let _ = (path, listener);
    }

    /// Removes every listener registered for `path`.
    fn unsubscribe(&self, path: &str) {
        let _ = path;
    }
}

impl<S: ConfigSource> ConfigSource for Arc<S> {
    fn get(&self, path: &str) -> Option<String> {
        (**self).get(path)
    }

    fn subscribe(&self, path: &str, listener: ConfigListener) {
        (**self).subscribe(path, listener);
    }

    fn unsubscribe(&self, path: &str) {
        (**self).unsubscribe(path);
    }
}

/// A source with no values and no notifications.
///
/// The default when an engine is built without a configuration backend; declared
/// policy values then apply unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConfigSource;

impl ConfigSource for NoopConfigSource {
    fn get(&self, _path: &str) -> Option<String> {
        None
    }
}

/// An in-memory source backed by a concurrent map.
///
/// [`set`][Self::set] fires the listeners subscribed to the written path, which makes
/// this source suitable for bootstrapping small deployments and for exercising
/// hot-reload behavior in tests.
#[derive(Default)]
pub struct MapConfigSource {
    values: DashMap<String, String>,
    listeners: DashMap<String, Vec<ConfigListener>>,
}

impl std::fmt::Debug for MapConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapConfigSource")
            .field("values", &self.values.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl MapConfigSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source pre-populated from `(path, value)` pairs.
    pub fn from_pairs<P, V, I>(pairs: I) -> Self
    where
        P: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (P, V)>,
    {
        let source = Self::default();
        for (path, value) in pairs {
            source.values.insert(path.into(), value.into());
        }
        source
    }

    /// Writes a value and notifies the path's subscribers.
    pub fn set(&self, path: impl Into<String>, value: impl Into<String>) {
        let path = path.into();
        let value = value.into();
        self.values.insert(path.clone(), value.clone());

        if let Some(listeners) = self.listeners.get(&path) {
            for listener in listeners.iter() {
                listener(&path, &value);
            }
        }
    }

    /// Removes a value without notifying subscribers.
    pub fn remove(&self, path: &str) {
        self.values.remove(path);
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, path: &str) -> Option<String> {
        self.values.get(path).map(|value| value.clone())
    }

    fn subscribe(&self, path: &str, listener: ConfigListener) {
        self.listeners.entry(path.to_owned()).or_default().push(listener);
    }

    fn unsubscribe(&self, path: &str) {
        self.listeners.remove(path);
    }
}
