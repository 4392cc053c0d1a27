// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::source::ConfigSource;
use super::value::{ConfigValue, SERVICE_NAME};
use super::OverrideTable;

/// Upper bound on updates applied per drain checkpoint, so a burst of
/// configuration churn cannot stall guarded calls.
pub(crate) const CONFIG_WATCH_QUEUE_UPDATE_LIMIT: usize = 50;

const UPDATE_QUEUE_CAPACITY: usize = 256;

/// A parsed property change waiting to be applied.
#[derive(Debug)]
pub(crate) struct PropertyUpdate {
    pub path: String,
    pub value: ConfigValue,
}

/// Subscribes to watched property paths and funnels their updates through a bounded
/// queue into the live override table.
///
/// Watching is opt-in: it requires `fault-tolerance.config.watch-enabled=true` and a
/// `fault-tolerance.config.watch-properties` list of property-name suffixes. Updates
/// are applied synchronously by [`drain`][Self::drain], invoked at the start of every
/// guarded call, so a change becomes visible to the next call for the path but never
/// to a call already in flight.
pub(crate) struct ConfigWatch {
    enabled: bool,
    watch_properties: Vec<String>,
    tx: mpsc::Sender<PropertyUpdate>,
    rx: Mutex<mpsc::Receiver<PropertyUpdate>>,
    subscribed: DashMap<String, ()>,
}

impl std::fmt::Debug for ConfigWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatch")
            .field("enabled", &self.enabled)
            .field("watch_properties", &self.watch_properties)
            .field("subscribed", &self.subscribed.len())
            .finish()
    }
}

impl ConfigWatch {
    pub fn new(source: &dyn ConfigSource) -> Self {
        let enabled = source
            .get(&format!("{SERVICE_NAME}.config.watch-enabled"))
            .and_then(|raw| raw.trim().parse::<bool>().ok())
            .unwrap_or(false);

        let watch_properties = if enabled {
            source
                .get(&format!("{SERVICE_NAME}.config.watch-properties"))
                .map(|raw| raw.split(',').map(|p| p.trim().to_owned()).filter(|p| !p.is_empty()).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let (tx, rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);

        Self {
            enabled,
            watch_properties,
            tx,
            rx: Mutex::new(rx),
            subscribed: DashMap::new(),
        }
    }

    /// Returns whether updates to `path` should be watched.
    pub fn is_watched(&self, path: &str) -> bool {
        self.enabled && self.watch_properties.iter().any(|suffix| path.ends_with(suffix.as_str()))
    }

    /// Subscribes to `path` if it is watched and not already subscribed.
    ///
    /// The listener parses the raw value on the source's notification thread; a value
    /// that parses to none of the supported types is logged and dropped, never queued.
    pub fn watch(&self, source: &dyn ConfigSource, path: &str) {
        if !self.is_watched(path) || self.subscribed.contains_key(path) {
            return;
        }
        self.subscribed.insert(path.to_owned(), ());

        let tx = self.tx.clone();
        let watched = path.to_owned();
        source.subscribe(
            path,
            Arc::new(move |updated_path, raw| {
                if updated_path != watched {
                    return;
                }

                let Some(value) = ConfigValue::parse(raw) else {
                    tracing::warn!(path = updated_path, value = raw, "dropping unparsable configuration update");
                    return;
                };

                let update = PropertyUpdate {
                    path: watched.clone(),
                    value,
                };
                if tx.try_send(update).is_err() {
                    tracing::warn!(path = updated_path, "configuration update queue is full; dropping update");
                }
            }),
        );
    }

    /// Applies queued updates to the override table, at most
    /// [`CONFIG_WATCH_QUEUE_UPDATE_LIMIT`] per call.
    ///
    /// Never blocks: if another caller is already draining, this checkpoint is a no-op.
    pub fn drain(&self, overrides: &OverrideTable) {
        let Some(mut rx) = self.rx.try_lock() else {
            return;
        };

        for _ in 0..CONFIG_WATCH_QUEUE_UPDATE_LIMIT {
            match rx.try_recv() {
                Ok(update) => {
                    tracing::debug!(path = update.path, value = ?update.value, "applying configuration update");
                    overrides.insert(update.path, update.value);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Drops every subscription this watcher registered on `source`.
    pub fn unsubscribe_all(&self, source: &dyn ConfigSource) {
        for entry in &self.subscribed {
            source.unsubscribe(entry.key());
        }
        self.subscribed.clear();
    }
}
