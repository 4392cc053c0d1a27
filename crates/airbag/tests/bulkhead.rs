// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for bulkhead admission using only public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use airbag::{BulkheadPolicy, Fault, FaultError, FaultTolerance, OperationDefinition, SignatureDescriptor};
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
#[error("render failed")]
struct RenderError;

impl Fault for RenderError {}

/// An operation that parks inside the guarded section until `gate` hands out a
/// permit, so tests control how long execution slots stay occupied.
fn parked_operation(
    gate: &Arc<Semaphore>,
    entered: &Arc<AtomicU32>,
) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, RenderError>> + Send>> + use<> {
    let gate = Arc::clone(gate);
    let entered = Arc::clone(entered);
    move || {
        let gate = Arc::clone(&gate);
        let entered = Arc::clone(&entered);
        Box::pin(async move {
            entered.fetch_add(1, Ordering::SeqCst);
            let _permit = gate.acquire().await;
            Ok(0)
        })
    }
}

async fn wait_until(entered: &Arc<AtomicU32>, count: u32) {
    while entered.load(Ordering::SeqCst) < count {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn sync_bulkhead_rejects_the_call_beyond_capacity() {
    let engine = FaultTolerance::new();
    let definition = Arc::new(
        OperationDefinition::<u32, RenderError>::new(SignatureDescriptor::of::<u32>("Renderer", "render"))
            .bulkhead(BulkheadPolicy::new(5)),
    );

    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(AtomicU32::new(0));

    let mut held = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        let definition = Arc::clone(&definition);
        let operation = parked_operation(&gate, &entered);
        held.push(tokio::spawn(async move { engine.execute(&definition, operation).await }));
    }
    wait_until(&entered, 5).await;

    // All five slots are occupied; the sixth caller is turned away at once.
    let rejected = engine.execute(&definition, parked_operation(&gate, &entered)).await;
    assert!(matches!(rejected, Err(FaultError::BulkheadRejected { .. })));
    assert_eq!(entered.load(Ordering::SeqCst), 5);

    gate.add_permits(5);
    for task in held {
        assert!(task.await.unwrap().is_ok());
    }

    // With slots free again the same definition admits new calls.
    gate.add_permits(1);
    assert!(engine.execute(&definition, parked_operation(&gate, &entered)).await.is_ok());
}

#[tokio::test]
async fn async_bulkhead_queues_then_rejects_past_the_queue() {
    let engine = FaultTolerance::new();
    let definition = Arc::new(
        OperationDefinition::<u32, RenderError>::new(
            SignatureDescriptor::of::<u32>("Renderer", "render").returning_future(),
        )
        .asynchronous()
        .bulkhead(BulkheadPolicy::new(1).waiting_queue_size(1)),
    );

    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(AtomicU32::new(0));

    let holder = tokio::spawn({
        let engine = engine.clone();
        let definition = Arc::clone(&definition);
        let operation = parked_operation(&gate, &entered);
        async move { engine.execute(&definition, operation).await }
    });
    wait_until(&entered, 1).await;

    // The queued call parks without entering the guarded section.
    let queued = tokio::spawn({
        let engine = engine.clone();
        let definition = Arc::clone(&definition);
        let operation = parked_operation(&gate, &entered);
        async move { engine.execute(&definition, operation).await }
    });
    // On the current-thread test runtime, yielding runs the spawned call up to
    // its park point in the waiting queue.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(entered.load(Ordering::SeqCst), 1);

    // Slot taken and queue full: the third call is rejected.
    let rejected = engine.execute(&definition, parked_operation(&gate, &entered)).await;
    assert!(matches!(rejected, Err(FaultError::BulkheadRejected { .. })));

    gate.add_permits(10);
    assert!(holder.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());
    assert_eq!(entered.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn slots_are_released_when_the_operation_fails() {
    let engine = FaultTolerance::new();
    let definition =
        OperationDefinition::<u32, RenderError>::new(SignatureDescriptor::of::<u32>("Renderer", "render"))
            .bulkhead(BulkheadPolicy::new(1));

    let failed = engine.execute(&definition, || async { Err::<u32, _>(RenderError) }).await;
    assert!(matches!(failed, Err(FaultError::Execution(_))));

    assert!(engine.execute(&definition, || async { Ok(1) }).await.is_ok());
}

#[tokio::test]
async fn declaring_async_without_a_future_signature_is_a_definition_error() {
    let engine = FaultTolerance::new();
    let definition =
        OperationDefinition::<u32, RenderError>::new(SignatureDescriptor::of::<u32>("Renderer", "render"))
            .asynchronous()
            .bulkhead(BulkheadPolicy::new(1));

    let result = engine.execute(&definition, || async { Ok(1) }).await;
    assert!(matches!(
        result,
        Err(FaultError::Definition(airbag::DefinitionError::AsyncReturnType(_)))
    ));
}
