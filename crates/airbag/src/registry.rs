// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-operation policy cache.
//!
//! Resolution is single-flight per key: the map entry is held while a definition
//! resolves, so concurrent first calls to one operation build exactly one policy
//! set and every later call reuses it. A failed resolution caches nothing; the
//! definition error is raised again on each call until the declaration is fixed.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::watch::ConfigWatch;
use crate::config::{ConfigSource, OverrideTable};
use crate::error::DefinitionError;
use crate::operation::{OperationDefinition, OperationKey};
use crate::policy::resolver::{self, PolicySet};

#[derive(Debug, Default)]
pub(crate) struct OperationRegistry {
    cache: DashMap<OperationKey, Arc<PolicySet>>,
}

impl OperationRegistry {
    /// Returns the cached policy set for the definition's key, resolving and
    /// caching it on first use.
    ///
    /// A cached set is only handed back when the definition's signature matches
    /// the one it was resolved from; two different targets colliding on one key is
    /// a definition error, not a silent policy share.
    pub fn resolve<T, E>(
        &self,
        definition: &OperationDefinition<T, E>,
        source: &dyn ConfigSource,
        watch: &ConfigWatch,
        overrides: &OverrideTable,
    ) -> Result<Arc<PolicySet>, DefinitionError>
    where
        T: 'static,
        E: std::error::Error + 'static,
    {
        match self.cache.entry(definition.operation_key()) {
            Entry::Occupied(entry) => {
                let set = entry.get();
                if set.signature != definition.signature {
                    return Err(DefinitionError::SignatureMismatch {
                        operation: entry.key().clone(),
                        existing: set.signature.to_string(),
                    });
                }
                Ok(Arc::clone(set))
            }
            Entry::Vacant(entry) => {
                let set = Arc::new(resolver::resolve(definition, source, watch, overrides)?);
                tracing::debug!(operation = %set.key, "resolved fault-tolerance policies");
                entry.insert(Arc::clone(&set));
                Ok(set)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NoopConfigSource;
    use crate::operation::SignatureDescriptor;
    use crate::policy::BulkheadPolicy;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    struct Fixture {
        registry: OperationRegistry,
        source: NoopConfigSource,
        watch: ConfigWatch,
        overrides: OverrideTable,
    }

    impl Fixture {
        fn new() -> Self {
            let source = NoopConfigSource;
            let watch = ConfigWatch::new(&source);
            Self {
                registry: OperationRegistry::default(),
                source,
                watch,
                overrides: OverrideTable::default(),
            }
        }

        fn resolve<T: 'static>(
            &self,
            definition: &OperationDefinition<T, Boom>,
        ) -> Result<Arc<PolicySet>, DefinitionError> {
            self.registry.resolve(definition, &self.source, &self.watch, &self.overrides)
        }
    }

    #[test]
    fn second_resolution_reuses_the_cached_set() {
        let fixture = Fixture::new();
        let definition =
            OperationDefinition::<u32, Boom>::new(SignatureDescriptor::of::<u32>("Svc", "op"));

        let first = fixture.resolve(&definition).unwrap();
        let second = fixture.resolve(&definition).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn colliding_key_with_different_signature_is_rejected() {
        let fixture = Fixture::new();
        let original =
            OperationDefinition::<u32, Boom>::new(SignatureDescriptor::of::<u32>("Svc", "op"));
        fixture.resolve(&original).unwrap();

        let collider = OperationDefinition::<String, Boom>::new(
            SignatureDescriptor::of::<String>("Svc", "op"),
        );
        assert!(matches!(
            fixture.resolve(&collider),
            Err(DefinitionError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn failed_resolution_is_not_cached() {
        let fixture = Fixture::new();
        let broken = OperationDefinition::<u32, Boom>::new(SignatureDescriptor::of::<u32>("Svc", "op"))
            .bulkhead(BulkheadPolicy::new(0));

        assert!(fixture.resolve(&broken).is_err());

        // A corrected declaration under the same key resolves cleanly.
        let fixed = OperationDefinition::<u32, Boom>::new(SignatureDescriptor::of::<u32>("Svc", "op"))
            .bulkhead(BulkheadPolicy::new(2));
        assert!(fixture.resolve(&fixed).is_ok());
    }
}
