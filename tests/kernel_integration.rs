//! Kernel-level integration scenarios: loop protection, pause/resume, and
//! idempotent emission.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use arbiter::domain::models::event::Event;
use arbiter::domain::models::kernel_state::KernelStatus;
use arbiter::domain::models::snapshot::stable_hash;
use arbiter::infrastructure::storage::memory::InMemoryPersistor;
use arbiter::services::handler_registry::FnHandler;
use arbiter::services::kernel::{EmitOptions, Kernel, KernelConfig};
use arbiter::services::loop_protector::LoopProtectorConfig;

fn kernel_with(config: KernelConfig) -> Arc<Kernel> {
    Kernel::new(config, Arc::new(InMemoryPersistor::new()))
}

/// S5: with a 3-event window the fourth emit is rejected and the kernel
/// keeps running.
#[tokio::test]
async fn loop_protection_trips_on_fourth_emit() {
    let kernel = kernel_with(KernelConfig {
        loop_protection: LoopProtectorConfig {
            enabled: true,
            max_event_count: 3,
            max_event_rate: 1_000_000.0,
            window_ms: 1_000,
        },
        ..Default::default()
    });
    kernel.initialize().await.unwrap();

    for _ in 0..3 {
        let receipt = kernel
            .emit("agent.tick", json!({}), EmitOptions::default())
            .await
            .unwrap();
        assert!(receipt.queued);
    }

    let err = kernel
        .emit("agent.tick", json!({}), EmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INFINITE_LOOP_DETECTED");
    assert_eq!(kernel.status().await, KernelStatus::Running);
    kernel.shutdown().await;
}

/// S6: pause captures context and counters; resume restores them after
/// in-memory mutation.
#[tokio::test]
async fn pause_resume_preserves_state() {
    let kernel = kernel_with(KernelConfig::default());
    kernel.initialize().await.unwrap();

    // Process a couple of events so the counter is non-zero.
    kernel
        .register_wildcard_handler(Arc::new(FnHandler(|_e: Event| async { Ok(None) })), None)
        .await
        .unwrap();
    for i in 0..2 {
        kernel
            .emit(&format!("agent.warm{i}"), json!({}), EmitOptions::default())
            .await
            .unwrap();
    }
    tokio::time::timeout(Duration::from_secs(2), async {
        while kernel.processor().stats().processed < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    kernel.set_context("ns", "k", json!(42)).await;
    let hash = kernel.pause("test").await.unwrap();
    let paused_count = kernel.event_count().await;

    // Mutate in-memory state while paused.
    kernel.set_context("ns", "k", json!("clobbered")).await;

    kernel.resume(&hash).await.unwrap();
    assert_eq!(kernel.get_context("ns", "k").await, Some(json!(42)));
    assert_eq!(kernel.event_count().await, paused_count);
    assert_eq!(kernel.status().await, KernelStatus::Running);
    kernel.shutdown().await;
}

/// Invariant 6: two emits with the same operation id produce one queued
/// event.
#[tokio::test]
async fn emit_is_idempotent_per_operation_id() {
    let kernel = kernel_with(KernelConfig::default());
    kernel.initialize().await.unwrap();

    let options = EmitOptions {
        operation_id: Some("op-x".to_string()),
        ..Default::default()
    };
    let first = kernel
        .emit("agent.step", json!({"n": 1}), options.clone())
        .await
        .unwrap();
    let second = kernel
        .emit("agent.step", json!({"n": 1}), options)
        .await
        .unwrap();

    assert!(first.queued);
    assert!(second.success);
    assert!(!second.queued);
    assert_eq!(kernel.queue().stats().await.total_enqueued, 1);
    kernel.shutdown().await;
}

/// Invariant 7: the snapshot hash is stable under reserialization of
/// equivalent state.
#[tokio::test]
async fn snapshot_hash_stable_across_serialization() {
    let state = json!({"beta": [1, 2, 3], "alpha": {"y": null, "x": true}});
    let reserialized: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();
    let reordered: serde_json::Value = serde_json::from_str(
        r#"{"alpha":{"x":true,"y":null},"beta":[1,2,3]}"#,
    )
    .unwrap();

    let h1 = stable_hash(&[], &state).unwrap();
    let h2 = stable_hash(&[], &reserialized).unwrap();
    let h3 = stable_hash(&[], &reordered).unwrap();
    assert_eq!(h1, h2);
    assert_eq!(h1, h3);
}

/// Pausing twice produces the same hash for unchanged state, and the
/// persistor deduplicates the append.
#[tokio::test]
async fn repeated_pause_of_same_state_reuses_hash() {
    let persistor: Arc<dyn arbiter::domain::ports::persistor::Persistor> =
        Arc::new(InMemoryPersistor::new());
    let kernel = Kernel::new(KernelConfig::default(), Arc::clone(&persistor));
    kernel.initialize().await.unwrap();
    kernel.set_context("ns", "k", json!(1)).await;

    let first = kernel.pause("one").await.unwrap();
    kernel.resume(&first).await.unwrap();

    use arbiter::domain::ports::persistor::Persistor;
    let before = persistor.count().await.unwrap();
    let second = kernel.pause("two").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(persistor.count().await.unwrap(), before);
    kernel.shutdown().await;
}

/// Atomic operations reject duplicates in flight but allow reuse after
/// completion, and clear the pending set on timeout.
#[tokio::test]
async fn atomic_operation_lifecycle() {
    let kernel = kernel_with(KernelConfig::default());
    kernel.initialize().await.unwrap();

    use arbiter::services::kernel::OperationOptions;

    let value = kernel
        .execute_atomic_operation(
            "op-lifecycle",
            || async { Ok(json!({"ok": true})) },
            OperationOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(value["ok"], true);

    let err = kernel
        .execute_atomic_operation(
            "op-timeout",
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("late"))
            },
            OperationOptions {
                timeout_ms: 25,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "OPERATION_TIMEOUT");
    assert_eq!(kernel.stats().await.pending_operations, 0);
    kernel.shutdown().await;
}
