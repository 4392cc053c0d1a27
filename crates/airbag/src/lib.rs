// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]

//! Policy-driven fault tolerance for guarded operations.
//!
//! This crate executes fallible operations under declarative resilience policies:
//! concurrency bulkheads, circuit breakers, attempt deadlines, bounded retries,
//! and fallbacks. Policies are declared per operation, resolved once into a cached
//! policy set, and every declared value can be overridden through path-addressed
//! configuration and hot-reloaded while calls are in flight.
//!
//! # Core Types
//!
//! - [`FaultTolerance`]: the engine; one per process, shared across operations.
//! - [`OperationDefinition`]: what the binding layer declares about one guarded
//!   operation, including its policies and optional fallback.
//! - [`Fault`] and [`FaultKind`]: classify application errors so policies can
//!   filter on failure kinds instead of concrete error types.
//! - [`FaultError`]: the failure surface of a guarded call.
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use airbag::{
//!     CircuitBreakerPolicy, FaultTolerance, OperationDefinition, RetryPolicy,
//!     SignatureDescriptor, TimeoutPolicy,
//! };
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("catalog unavailable")]
//! struct CatalogError;
//! impl airbag::Fault for CatalogError {}
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = FaultTolerance::new();
//!
//! let lookup = OperationDefinition::<String, CatalogError>::new(
//!     SignatureDescriptor::of::<String>("Catalog", "title"),
//! )
//! .timeout(TimeoutPolicy::new(Duration::from_millis(250)))
//! .retry(RetryPolicy::new(2).delay(Duration::from_millis(20)))
//! .circuit_breaker(CircuitBreakerPolicy::new())
//! .fallback_method("cached_title", |_| Ok("unknown title".to_owned()));
//!
//! let title = engine
//!     .execute(&lookup, || async { Ok("Dune".to_owned()) })
//!     .await?;
//! assert_eq!(title, "Dune");
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Properties are addressed as
//! `fault-tolerance.<commandKey>.<groupKey>.<policyType>.<propertyName>`; the
//! command and group segments may be omitted for group-wide or global values, and
//! the most specific present path wins. Hot reload is opt-in through
//! `fault-tolerance.config.watch-enabled` plus a `watch-properties` list; updates
//! are applied in bounded batches at the start of each guarded call, so a change
//! becomes visible to the next call but never to one already in flight.

mod breaker;
mod bulkhead;
mod config;
mod error;
mod executor;
mod kind;
mod metrics;
mod operation;
mod policy;
mod registry;
mod retry;
mod timeout;

pub use config::{ConfigListener, ConfigSource, ConfigValue, MapConfigSource, NoopConfigSource, PolicyType, SERVICE_NAME};
pub use error::{DefinitionError, FaultError};
pub use executor::{FaultTolerance, FaultToleranceBuilder};
pub use kind::{Fault, FaultKind, KindSet};
#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub use metrics::OtelSink;
pub use metrics::{MetricKey, MetricsSink, NoopSink};
pub use operation::{OperationDefinition, OperationKey, SignatureDescriptor};
pub use policy::fallback::{FallbackHandler, FallbackMethod};
pub use policy::{BulkheadPolicy, CircuitBreakerPolicy, RetryPolicy, Scope, TimeoutPolicy};
