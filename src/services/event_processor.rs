//! Event processor: pulls queued events through the middleware chain into
//! matching handlers.
//!
//! Handler-returned values that parse as well-formed events are submitted
//! recursively through the in-memory fast path; that recursion is the only
//! thing that increases processing depth. Each cascade carries its own
//! type chain for loop detection, so independent events of the same type
//! never trip the guard.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::{as_reaction_event, Event};
use crate::services::event_queue::BoundedEventQueue;
use crate::services::handler_registry::{HandlerRegistry, HandlerRecord};
use crate::services::middleware::{MiddlewareChain, MiddlewareError};

/// Configuration for the event processor.
#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    /// Maximum cascade recursion depth.
    pub max_event_depth: usize,
    /// Maximum length of one cascade's type chain.
    pub max_event_chain_length: usize,
    /// Handler-count threshold above which dispatch splits into batches.
    pub batch_size: usize,
    /// Idle poll interval for the worker loop.
    pub poll_interval_ms: u64,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self {
            max_event_depth: 100,
            max_event_chain_length: 1_000,
            batch_size: 100,
            poll_interval_ms: 10,
        }
    }
}

/// Processor statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventProcessorStats {
    pub processed: u64,
    pub failed: u64,
    pub reactions_spawned: u64,
    pub chain_loops_detected: u64,
    pub depth_rejections: u64,
}

/// Runs queued events through middleware into handlers.
pub struct EventProcessor {
    config: EventProcessorConfig,
    registry: Arc<HandlerRegistry>,
    queue: Arc<BoundedEventQueue>,
    chain: MiddlewareChain,
    cancel: CancellationToken,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    reactions_spawned: AtomicU64,
    chain_loops: AtomicU64,
    depth_rejections: AtomicU64,
}

impl EventProcessor {
    pub fn new(
        config: EventProcessorConfig,
        registry: Arc<HandlerRegistry>,
        queue: Arc<BoundedEventQueue>,
        chain: MiddlewareChain,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
            chain,
            cancel,
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            reactions_spawned: AtomicU64::new(0),
            chain_loops: AtomicU64::new(0),
            depth_rejections: AtomicU64::new(0),
        }
    }

    /// Process one event through the full pipeline, starting a fresh
    /// cascade. Used by the worker loop and directly by tests.
    pub async fn process(&self, event: &Event) -> RuntimeResult<()> {
        let mut type_chain: Vec<String> = Vec::new();
        self.process_at_depth(event, 0, &mut type_chain).await
    }

    /// Recursive cascade step; boxed because reactions re-enter it.
    fn process_at_depth<'a>(
        &'a self,
        event: &'a Event,
        depth: usize,
        type_chain: &'a mut Vec<String>,
    ) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            // 1. Admission.
            if depth >= self.config.max_event_depth {
                self.depth_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(RuntimeError::DepthExceeded {
                    depth,
                    max: self.config.max_event_depth,
                });
            }
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled("processor stopping".into()));
            }

            // 2. Chain tracking.
            let type_key = event.event_type.as_str().to_string();
            let already_seen = type_chain.contains(&type_key);
            type_chain.push(type_key.clone());
            while type_chain.len() > self.config.max_event_chain_length {
                type_chain.remove(0);
            }
            if already_seen && type_chain.len() > 1 {
                self.chain_loops.fetch_add(1, Ordering::Relaxed);
                return Err(RuntimeError::EventChainLoop {
                    event_type: type_key,
                });
            }

            // 3-4. Dispatch through middleware to all matching handlers.
            let handlers = self.registry.matching(event.event_type.as_str()).await;
            if handlers.is_empty() {
                debug!(event_type = %event.event_type, "no handlers matched");
            }

            let mut reactions: Vec<Event> = Vec::new();
            let mut first_error: Option<MiddlewareError> = None;

            if handlers.len() > self.config.batch_size {
                for group in handlers.chunks(self.config.batch_size) {
                    let outcomes = join_all(
                        group.iter().map(|record| self.invoke(event, record)),
                    )
                    .await;
                    for outcome in outcomes {
                        match outcome {
                            Ok(Some(reaction)) => reactions.push(reaction),
                            Ok(None) => {}
                            Err(e) => {
                                if first_error.is_none() {
                                    first_error = Some(e);
                                }
                            }
                        }
                    }
                }
            } else {
                for record in &handlers {
                    match self.invoke(event, record).await {
                        Ok(Some(reaction)) => reactions.push(reaction),
                        Ok(None) => {}
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                    }
                }
            }

            // 5. Any handler failure fails the event.
            if let Some(e) = first_error {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "event dispatch failed");
                return Err(e.original);
            }

            self.processed.fetch_add(1, Ordering::Relaxed);

            // Recursive fast path for well-formed reaction events.
            for reaction in reactions {
                self.reactions_spawned.fetch_add(1, Ordering::Relaxed);
                self.process_at_depth(&reaction, depth + 1, type_chain).await?;
            }
            Ok(())
        })
    }

    /// One handler invocation through the middleware chain, surfacing any
    /// well-formed reaction event.
    async fn invoke(
        &self,
        event: &Event,
        record: &Arc<HandlerRecord>,
    ) -> Result<Option<Event>, MiddlewareError> {
        record.touch();
        let value = self.chain.execute(event, record.handler.as_ref()).await?;
        Ok(value.as_ref().and_then(as_reaction_event))
    }

    /// Pull and process one batch from the queue; returns how many events
    /// were handled. Guarded against concurrent re-entry.
    pub async fn run_once(&self) -> usize {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }

        let batch = self.queue.dequeue_batch(self.config.batch_size).await;
        let count = batch.len();

        let outcomes = join_all(batch.iter().map(|event| async move {
            (event.id, self.process(event).await)
        }))
        .await;

        for (event_id, outcome) in outcomes {
            let result = match outcome {
                Ok(()) => self.queue.ack(event_id).await,
                Err(e) if e.is_retryable() => {
                    self.queue.nack(event_id, Some(e.to_string())).await
                }
                Err(e) => {
                    self.queue
                        .nack_non_retryable(event_id, Some(e.to_string()))
                        .await
                }
            };
            if let Err(e) = result {
                warn!(%event_id, error = %e, "queue acknowledgment failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        count
    }

    /// Spawn the worker loop; it drains batches until cancelled.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let idle = Duration::from_millis(processor.config.poll_interval_ms.max(1));
            loop {
                if processor.cancel.is_cancelled() {
                    break;
                }
                let handled = processor.run_once().await;
                if handled == 0 {
                    tokio::select! {
                        () = processor.cancel.cancelled() => break,
                        () = tokio::time::sleep(idle) => {}
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> EventProcessorStats {
        EventProcessorStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reactions_spawned: self.reactions_spawned.load(Ordering::Relaxed),
            chain_loops_detected: self.chain_loops.load(Ordering::Relaxed),
            depth_rejections: self.depth_rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::EventType;
    use crate::services::event_queue::EventQueueConfig;
    use crate::services::handler_registry::{EventHandler, FnHandler, HandlerRegistryConfig};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;

    fn processor_with(
        registry: Arc<HandlerRegistry>,
        config: EventProcessorConfig,
    ) -> (Arc<EventProcessor>, Arc<BoundedEventQueue>) {
        let queue = Arc::new(BoundedEventQueue::new(EventQueueConfig {
            retry_backoff_ms: 1,
            max_backoff_ms: 2,
            ..Default::default()
        }));
        let processor = Arc::new(EventProcessor::new(
            config,
            registry,
            Arc::clone(&queue),
            MiddlewareChain::empty(),
            CancellationToken::new(),
        ));
        (processor, queue)
    }

    fn counting_handler(counter: Arc<AtomicU32>) -> Arc<dyn EventHandler> {
        Arc::new(FnHandler(move |_e: Event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }))
    }

    #[tokio::test]
    async fn test_process_dispatches_to_matching_handlers() {
        let registry = Arc::new(HandlerRegistry::with_defaults());
        let counter = Arc::new(AtomicU32::new(0));
        registry
            .register_exact("agent.tick", counting_handler(Arc::clone(&counter)), None)
            .await;
        registry
            .register_wildcard(counting_handler(Arc::clone(&counter)), None)
            .await;

        let (processor, _queue) = processor_with(registry, EventProcessorConfig::default());
        let event = Event::parse_new("agent.tick", "t", json!({})).unwrap();
        processor.process(&event).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(processor.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_reaction_events_recurse_with_depth() {
        let registry = Arc::new(HandlerRegistry::with_defaults());
        let seen = Arc::new(AtomicU32::new(0));

        // agent.first reacts with agent.second; agent.second is terminal.
        registry
            .register_exact(
                "agent.first",
                Arc::new(FnHandler(|e: Event| async move {
                    let reaction =
                        e.derive(EventType::parse("agent.second").unwrap(), json!({"hop": 2}));
                    Ok(Some(serde_json::to_value(reaction).unwrap()))
                })),
                None,
            )
            .await;
        let seen_clone = Arc::clone(&seen);
        registry
            .register_exact(
                "agent.second",
                Arc::new(FnHandler(move |_e: Event| {
                    let seen = Arc::clone(&seen_clone);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                })),
                None,
            )
            .await;

        let (processor, _queue) = processor_with(registry, EventProcessorConfig::default());
        let event = Event::parse_new("agent.first", "t", json!({})).unwrap();
        processor.process(&event).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(processor.stats().reactions_spawned, 1);
    }

    #[tokio::test]
    async fn test_chain_loop_detection() {
        let registry = Arc::new(HandlerRegistry::with_defaults());
        // agent.ping reacts with agent.pong, which reacts with agent.ping.
        registry
            .register_exact(
                "agent.ping",
                Arc::new(FnHandler(|e: Event| async move {
                    let r = e.derive(EventType::parse("agent.pong").unwrap(), json!({}));
                    Ok(Some(serde_json::to_value(r).unwrap()))
                })),
                None,
            )
            .await;
        registry
            .register_exact(
                "agent.pong",
                Arc::new(FnHandler(|e: Event| async move {
                    let r = e.derive(EventType::parse("agent.ping").unwrap(), json!({}));
                    Ok(Some(serde_json::to_value(r).unwrap()))
                })),
                None,
            )
            .await;

        let (processor, _queue) = processor_with(registry, EventProcessorConfig::default());
        let event = Event::parse_new("agent.ping", "t", json!({})).unwrap();
        let err = processor.process(&event).await.unwrap_err();
        assert_eq!(err.code(), "EVENT_LOOP_DETECTED");
        assert_eq!(processor.stats().chain_loops_detected, 1);
    }

    #[tokio::test]
    async fn test_independent_same_type_events_do_not_trip_loop_guard() {
        let registry = Arc::new(HandlerRegistry::with_defaults());
        let counter = Arc::new(AtomicU32::new(0));
        registry
            .register_exact("agent.tick", counting_handler(Arc::clone(&counter)), None)
            .await;

        let (processor, _queue) = processor_with(registry, EventProcessorConfig::default());
        for _ in 0..3 {
            let event = Event::parse_new("agent.tick", "t", json!({})).unwrap();
            processor.process(&event).await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(processor.stats().chain_loops_detected, 0);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let registry = Arc::new(HandlerRegistry::with_defaults());
        // Each distinct type reacts with the next, never repeating, so the
        // chain guard stays quiet and only depth stops the cascade.
        for i in 0..10 {
            registry
                .register_exact(
                    format!("agent.hop{i}"),
                    Arc::new(FnHandler(move |e: Event| async move {
                        let next = EventType::parse(format!("agent.hop{}", i + 1)).unwrap();
                        let r = e.derive(next, json!({}));
                        Ok(Some(serde_json::to_value(r).unwrap()))
                    })),
                    None,
                )
                .await;
        }

        let (processor, _queue) = processor_with(
            registry,
            EventProcessorConfig {
                max_event_depth: 3,
                ..Default::default()
            },
        );
        let event = Event::parse_new("agent.hop0", "t", json!({})).unwrap();
        let err = processor.process(&event).await.unwrap_err();
        assert_eq!(err.code(), "DEPTH_EXCEEDED");
        assert_eq!(processor.stats().depth_rejections, 1);
    }

    #[tokio::test]
    async fn test_handler_error_nacks_event() {
        let registry = Arc::new(HandlerRegistry::with_defaults());
        registry
            .register_exact(
                "agent.bad",
                Arc::new(FnHandler(|_e: Event| async {
                    Err::<Option<Value>, _>(RuntimeError::Storage("boom".into()))
                })),
                None,
            )
            .await;

        let (processor, queue) = processor_with(registry, EventProcessorConfig::default());
        queue
            .enqueue(Event::parse_new("agent.bad", "t", json!({})).unwrap())
            .await
            .unwrap();

        let handled = processor.run_once().await;
        assert_eq!(handled, 1);
        let stats = queue.stats().await;
        assert_eq!(stats.total_nacked, 1);
        assert_eq!(stats.scheduled_retries, 1);
    }

    #[tokio::test]
    async fn test_run_once_acks_successes() {
        let registry = Arc::new(HandlerRegistry::with_defaults());
        let counter = Arc::new(AtomicU32::new(0));
        registry
            .register_wildcard(counting_handler(Arc::clone(&counter)), None)
            .await;

        let (processor, queue) = processor_with(registry, EventProcessorConfig::default());
        for i in 0..5 {
            queue
                .enqueue(Event::parse_new(&format!("agent.e{i}"), &format!("t{i}"), json!({})).unwrap())
                .await
                .unwrap();
        }

        let handled = processor.run_once().await;
        assert_eq!(handled, 5);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(queue.stats().await.total_acked, 5);
    }

    #[tokio::test]
    async fn test_worker_loop_drains_and_stops() {
        let registry = Arc::new(HandlerRegistry::new(HandlerRegistryConfig::default()));
        let counter = Arc::new(AtomicU32::new(0));
        registry
            .register_wildcard(counting_handler(Arc::clone(&counter)), None)
            .await;

        let queue = Arc::new(BoundedEventQueue::with_defaults());
        let cancel = CancellationToken::new();
        let processor = Arc::new(EventProcessor::new(
            EventProcessorConfig {
                poll_interval_ms: 1,
                ..Default::default()
            },
            registry,
            Arc::clone(&queue),
            MiddlewareChain::empty(),
            cancel.clone(),
        ));

        let handle = processor.start();
        for i in 0..3 {
            queue
                .enqueue(Event::parse_new("agent.work", &format!("t{i}"), json!({})).unwrap())
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
