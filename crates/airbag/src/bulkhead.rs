// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Concurrency isolation.
//!
//! A bulkhead caps how many executions of one operation run at once. Synchronous
//! operations reject immediately when the cap is reached; asynchronous ones may
//! park in a bounded waiting queue and are admitted in arrival order as permits
//! free up. Both limits are live properties and are reconciled against the
//! semaphore on every admission attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::{OverrideTable, Property};
use crate::metrics::{MetricKey, MetricsSink};

/// Holds one execution slot; dropping it releases the slot to the next waiter.
#[derive(Debug)]
pub(crate) struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Result of asking the bulkhead for a slot.
#[derive(Debug)]
pub(crate) enum Admission {
    /// A slot was granted. `waited` is how long the call sat in the waiting queue,
    /// `None` when it was admitted immediately.
    Granted {
        permit: BulkheadPermit,
        waited: Option<Duration>,
    },
    /// Capacity and (for asynchronous operations) the waiting queue are exhausted.
    Rejected,
}

pub(crate) struct Bulkhead {
    semaphore: Arc<Semaphore>,
    /// Number of permits the semaphore is currently sized to, under the lock so
    /// concurrent reconciliations cannot double-apply a resize.
    granted: Mutex<usize>,
    waiting: AtomicUsize,
    max_concurrent: Property<u32>,
    queue_size: Property<u32>,
    asynchronous: bool,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("granted", &*self.granted.lock())
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .field("asynchronous", &self.asynchronous)
            .finish_non_exhaustive()
    }
}

impl Bulkhead {
    pub fn new(
        overrides: &OverrideTable,
        max_concurrent: Property<u32>,
        queue_size: Property<u32>,
        asynchronous: bool,
    ) -> Self {
        let initial = max_concurrent.current(overrides).max(1) as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(initial)),
            granted: Mutex::new(initial),
            waiting: AtomicUsize::new(0),
            max_concurrent,
            queue_size,
            asynchronous,
        }
    }

    /// The number of calls currently parked in the waiting queue.
    #[cfg(test)]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Brings the semaphore's size in line with the live `max-concurrent` value.
    ///
    /// A shrink can only reclaim permits that are not in use; the remainder is
    /// reclaimed on later calls as in-flight executions release their slots.
    fn reconcile(&self, overrides: &OverrideTable) {
        let target = self.max_concurrent.current(overrides).max(1) as usize;
        let mut granted = self.granted.lock();
        if target > *granted {
            self.semaphore.add_permits(target - *granted);
            *granted = target;
        } else if target < *granted {
            let removed = self.semaphore.forget_permits(*granted - target);
            *granted -= removed;
        }
    }

    /// Requests a slot for one execution.
    ///
    /// `queue_gauge`, when present, tracks the waiting-queue population for the
    /// duration of any wait.
    pub async fn admit(
        &self,
        overrides: &OverrideTable,
        queue_gauge: Option<(&dyn MetricsSink, &MetricKey)>,
    ) -> Admission {
        self.reconcile(overrides);

        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Admission::Granted {
                permit: BulkheadPermit { _permit: permit },
                waited: None,
            };
        }

        if !self.asynchronous {
            return Admission::Rejected;
        }

        let queue_size = self.queue_size.current(overrides) as usize;
        let enqueued = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < queue_size).then(|| waiting + 1)
            })
            .is_ok();
        if !enqueued {
            return Admission::Rejected;
        }

        // Unwinds the queue accounting even if the waiting call is cancelled.
        struct QueueSlot<'a> {
            waiting: &'a AtomicUsize,
            gauge: Option<(&'a dyn MetricsSink, &'a MetricKey)>,
        }
        impl Drop for QueueSlot<'_> {
            fn drop(&mut self) {
                self.waiting.fetch_sub(1, Ordering::AcqRel);
                if let Some((sink, key)) = self.gauge {
                    sink.adjust(key, -1);
                }
            }
        }

        let slot = QueueSlot {
            waiting: &self.waiting,
            gauge: queue_gauge,
        };
        if let Some((sink, key)) = queue_gauge {
            sink.adjust(key, 1);
        }

        let entered = Instant::now();
        let acquired = Arc::clone(&self.semaphore).acquire_owned().await;
        drop(slot);

        match acquired {
            Ok(permit) => Admission::Granted {
                permit: BulkheadPermit { _permit: permit },
                waited: Some(entered.elapsed()),
            },
            // The semaphore is never closed; treat it as exhaustion if it ever is.
            Err(_) => Admission::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{precedence_paths, ConfigValue, PolicyType};

    fn bulkhead(max_concurrent: u32, queue_size: u32, asynchronous: bool) -> (Bulkhead, OverrideTable) {
        let overrides = OverrideTable::default();
        let paths = |property| precedence_paths("Svc-op", "Svc", PolicyType::Bulkhead, property);
        let bulkhead = Bulkhead::new(
            &overrides,
            Property::new(max_concurrent, paths("value")),
            Property::new(queue_size, paths("waiting-task-queue")),
            asynchronous,
        );
        (bulkhead, overrides)
    }

    #[tokio::test]
    async fn sync_bulkhead_rejects_beyond_capacity() {
        let (bulkhead, overrides) = bulkhead(5, 0, false);

        let mut held = Vec::new();
        for _ in 0..5 {
            match bulkhead.admit(&overrides, None).await {
                Admission::Granted { permit, waited } => {
                    assert!(waited.is_none());
                    held.push(permit);
                }
                Admission::Rejected => panic!("slot should be free"),
            }
        }

        assert!(matches!(bulkhead.admit(&overrides, None).await, Admission::Rejected));

        // Releasing one slot admits the next call.
        drop(held.pop());
        assert!(matches!(bulkhead.admit(&overrides, None).await, Admission::Granted { .. }));
    }

    #[tokio::test]
    async fn async_bulkhead_queues_up_to_the_queue_limit() {
        let (bulkhead, overrides) = bulkhead(1, 1, true);
        let bulkhead = Arc::new(bulkhead);
        let overrides = Arc::new(overrides);

        let first = match bulkhead.admit(&overrides, None).await {
            Admission::Granted { permit, .. } => permit,
            Admission::Rejected => panic!("slot should be free"),
        };

        let queued = tokio::spawn({
            let bulkhead = Arc::clone(&bulkhead);
            let overrides = Arc::clone(&overrides);
            async move { bulkhead.admit(&overrides, None).await }
        });

        // Let the queued call park before exhausting the queue.
        while bulkhead.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(bulkhead.admit(&overrides, None).await, Admission::Rejected));

        drop(first);
        match queued.await.unwrap() {
            Admission::Granted { waited, .. } => assert!(waited.is_some()),
            Admission::Rejected => panic!("queued call should be admitted"),
        }
        assert_eq!(bulkhead.waiting(), 0);
    }

    #[tokio::test]
    async fn growing_max_concurrent_takes_effect_live() {
        let (bulkhead, overrides) = bulkhead(1, 0, false);

        let held = bulkhead.admit(&overrides, None).await;
        assert!(matches!(held, Admission::Granted { .. }));
        assert!(matches!(bulkhead.admit(&overrides, None).await, Admission::Rejected));

        overrides.insert("fault-tolerance.bulkhead.value".to_owned(), ConfigValue::Int(2));
        assert!(matches!(bulkhead.admit(&overrides, None).await, Admission::Granted { .. }));
    }

    #[tokio::test]
    async fn shrinking_max_concurrent_reclaims_free_permits() {
        let (bulkhead, overrides) = bulkhead(3, 0, false);

        overrides.insert("fault-tolerance.bulkhead.value".to_owned(), ConfigValue::Int(1));

        let first = bulkhead.admit(&overrides, None).await;
        assert!(matches!(first, Admission::Granted { .. }));
        assert!(matches!(bulkhead.admit(&overrides, None).await, Admission::Rejected));
    }
}
