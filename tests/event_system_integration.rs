//! Event system integration: ACK/DLQ accounting, retry bounds, and
//! cross-kernel bridge forwarding.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use arbiter::domain::errors::RuntimeError;
use arbiter::domain::models::event::{Event, KernelNamespace};
use arbiter::infrastructure::storage::memory::InMemoryPersistor;
use arbiter::services::event_processor::{EventProcessor, EventProcessorConfig};
use arbiter::services::event_queue::{BoundedEventQueue, EventQueueConfig, ReprocessCriteria};
use arbiter::services::handler_registry::{FnHandler, HandlerRegistry};
use arbiter::services::kernel::EmitOptions;
use arbiter::services::middleware::{MiddlewareChain, RetryConfig, RetryMiddleware};
use arbiter::services::multi_kernel::{MultiKernelConfig, MultiKernelManager};

fn fast_queue(max_retries: u32) -> Arc<BoundedEventQueue> {
    Arc::new(BoundedEventQueue::new(EventQueueConfig {
        max_retries,
        retry_backoff_ms: 1,
        max_backoff_ms: 4,
        ..Default::default()
    }))
}

/// Invariant 1: every enqueued event is either ACKed exactly once or
/// lands in the DLQ exactly once, never both.
#[tokio::test]
async fn events_ack_once_or_dead_letter_once() {
    let registry = Arc::new(HandlerRegistry::with_defaults());
    // Odd-numbered events fail deterministically on every attempt.
    registry
        .register_wildcard(
            Arc::new(FnHandler(|event: Event| async move {
                if event.data["n"].as_u64().unwrap_or(0) % 2 == 1 {
                    Err(RuntimeError::Storage("odd events always fail".into()))
                } else {
                    Ok(None)
                }
            })),
            None,
        )
        .await;

    let queue = fast_queue(1);
    let processor = Arc::new(EventProcessor::new(
        EventProcessorConfig::default(),
        registry,
        Arc::clone(&queue),
        MiddlewareChain::empty(),
        CancellationToken::new(),
    ));

    let total = 10;
    for n in 0..total {
        queue
            .enqueue(
                Event::parse_new("agent.work", &format!("t{n}"), json!({"n": n})).unwrap(),
            )
            .await
            .unwrap();
    }

    // Drain through retries until the queue settles.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            processor.run_once().await;
            if queue.is_idle().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let stats = queue.stats().await;
    assert_eq!(stats.total_acked, 5);
    assert_eq!(stats.total_dead_lettered, 5);
    assert_eq!(stats.total_acked + stats.total_dead_lettered, total);
    assert_eq!(stats.in_flight, 0);
}

/// Invariant 2: a throwing handler runs at most `max_attempts` times per
/// event under the retry middleware.
#[tokio::test]
async fn retry_middleware_bounds_handler_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = Arc::clone(&attempts);

    let registry = Arc::new(HandlerRegistry::with_defaults());
    registry
        .register_wildcard(
            Arc::new(FnHandler(move |_event: Event| {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<Option<Value>, _>(RuntimeError::Storage("always down".into()))
                }
            })),
            None,
        )
        .await;

    let queue = fast_queue(0);
    let chain = MiddlewareChain::new(vec![Arc::new(RetryMiddleware::new(RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        non_retryable_errors: vec![],
    }))]);
    let processor = EventProcessor::new(
        EventProcessorConfig::default(),
        registry,
        Arc::clone(&queue),
        chain,
        CancellationToken::new(),
    );

    queue
        .enqueue(Event::parse_new("agent.doomed", "t", json!({})).unwrap())
        .await
        .unwrap();
    processor.run_once().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(queue.stats().await.total_dead_lettered, 1);
}

/// DLQ reprocessing re-enqueues matched entries at the tail.
#[tokio::test]
async fn dlq_reprocess_requeues_events() {
    let queue = fast_queue(0);
    queue
        .enqueue(Event::parse_new("agent.boom", "t1", json!({})).unwrap())
        .await
        .unwrap();
    for event in queue.dequeue_batch(10).await {
        queue.nack(event.id, Some("failed".into())).await.unwrap();
    }
    assert_eq!(queue.stats().await.dead_letters, 1);

    let result = queue
        .reprocess_dlq_by_criteria(ReprocessCriteria {
            max_age: Some(Duration::from_secs(60)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(result.reprocessed_count, 1);

    let stats = queue.stats().await;
    assert_eq!(stats.dead_letters, 0);
    assert_eq!(stats.pending, 1);
}

/// Invariant 10: a bridged event appears in the target kernel's queue
/// exactly once with the original correlation id.
#[tokio::test]
async fn bridge_forwards_exactly_once_with_correlation() {
    let manager = MultiKernelManager::new(MultiKernelConfig::dual("acme", "job-b"), |_spec| {
        Arc::new(InMemoryPersistor::new())
    });
    manager.initialize().await.unwrap();

    let correlation_id = Uuid::new_v4();
    manager
        .emit(
            "agent.tool.call",
            json!({"tool": "search"}),
            EmitOptions {
                correlation_id: Some(correlation_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while manager.status().await.recent_cross_kernel.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bridge should forward the event");

    let obs = manager
        .kernel_for_namespace(KernelNamespace::Observability)
        .await
        .unwrap();
    assert_eq!(obs.queue().stats().await.total_enqueued, 1);

    let status = manager.status().await;
    assert_eq!(status.recent_cross_kernel.len(), 1);
    assert_eq!(
        status.recent_cross_kernel[0].correlation_id,
        Some(correlation_id)
    );
    manager.shutdown().await;
}

/// Observability-namespace types route to the observability kernel, and
/// the bridge never echoes them back.
#[tokio::test]
async fn observability_events_never_bridge_back() {
    let manager = MultiKernelManager::new(MultiKernelConfig::dual("acme", "job-o"), |_spec| {
        Arc::new(InMemoryPersistor::new())
    });
    manager.initialize().await.unwrap();

    for event_type in ["obs.span", "log.line", "metric.count", "agent.log.entry"] {
        manager
            .emit(event_type, json!({}), EmitOptions::default())
            .await
            .unwrap();
    }

    // Give workers a moment; nothing must cross the bridge.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(manager.status().await.recent_cross_kernel.is_empty());

    let agent = manager
        .kernel_for_namespace(KernelNamespace::Agent)
        .await
        .unwrap();
    assert_eq!(agent.queue().stats().await.total_enqueued, 0);
    manager.shutdown().await;
}
