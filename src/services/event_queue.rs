//! Bounded FIFO event queue with ACK/NACK, retry scheduling, and a
//! dead-letter queue.
//!
//! Ordering is FIFO overall and strict per `thread_id`: an event is never
//! handed out while another event of the same thread is in flight.
//! Backpressure is synchronous; `enqueue` fails with `QUEUE_FULL` instead
//! of blocking the caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::{Event, EventId};

/// Configuration for the bounded event queue.
#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    /// Maximum queued (pending + retry-scheduled) events.
    pub queue_size: usize,
    /// Maximum events handed out per `dequeue_batch` call.
    pub batch_size: usize,
    /// Retries before an event is dead-lettered.
    pub max_retries: u32,
    /// Base retry backoff in milliseconds.
    pub retry_backoff_ms: u64,
    /// Cap on the exponential retry backoff.
    pub max_backoff_ms: u64,
    /// Track in-flight entries and require ACKs. Fire-and-forget queues
    /// (the observability kernel) turn this off.
    pub enable_acks: bool,
    /// Reject duplicate event ids.
    pub enable_idempotency: bool,
    /// Bound on the duplicate-id tracking set.
    pub dedup_capacity: usize,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 100,
            max_retries: 3,
            retry_backoff_ms: 100,
            max_backoff_ms: 30_000,
            enable_acks: true,
            enable_idempotency: true,
            dedup_capacity: 50_000,
        }
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub queued: bool,
}

/// An event that exhausted its retries.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event: Event,
    pub error: Option<String>,
    pub attempts: u32,
    pub dead_at: DateTime<Utc>,
}

/// Criteria for re-enqueuing dead letters.
#[derive(Debug, Clone, Default)]
pub struct ReprocessCriteria {
    /// Only entries dead-lettered within this duration.
    pub max_age: Option<Duration>,
    /// Maximum entries to reprocess.
    pub limit: Option<usize>,
    /// Only entries whose event type matches exactly.
    pub event_type: Option<String>,
}

/// Result of a DLQ reprocess pass.
#[derive(Debug, Clone)]
pub struct ReprocessResult {
    pub reprocessed_count: usize,
    pub events: Vec<Event>,
}

/// Queue statistics for status surfaces and tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventQueueStats {
    pub pending: usize,
    pub scheduled_retries: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
    pub total_enqueued: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
    pub total_dead_lettered: u64,
}

struct InFlightEntry {
    event: Event,
    attempts: u32,
}

struct DelayedEntry {
    event: Event,
    attempts: u32,
    ready_at: Instant,
}

struct QueueInner {
    pending: VecDeque<(Event, u32)>,
    delayed: Vec<DelayedEntry>,
    in_flight: HashMap<EventId, InFlightEntry>,
    dlq: VecDeque<DeadLetter>,
    seen_ids: HashSet<EventId>,
    seen_order: VecDeque<EventId>,
    stats: EventQueueStats,
}

impl QueueInner {
    fn depth(&self) -> usize {
        self.pending.len() + self.delayed.len()
    }

    fn remember(&mut self, id: EventId, capacity: usize) {
        if self.seen_ids.insert(id) {
            self.seen_order.push_back(id);
            while self.seen_order.len() > capacity {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen_ids.remove(&old);
                }
            }
        }
    }

    /// Move retry-scheduled entries whose backoff has elapsed back into
    /// the pending tail, preserving their schedule order.
    fn promote_ready(&mut self, now: Instant) {
        let mut ready: Vec<DelayedEntry> = Vec::new();
        self.delayed.retain_mut(|entry| {
            if entry.ready_at <= now {
                ready.push(DelayedEntry {
                    event: entry.event.clone(),
                    attempts: entry.attempts,
                    ready_at: entry.ready_at,
                });
                false
            } else {
                true
            }
        });
        ready.sort_by_key(|e| e.ready_at);
        for entry in ready {
            self.pending.push_back((entry.event, entry.attempts));
        }
    }
}

/// Bounded FIFO queue with ACK/NACK and dead-lettering.
pub struct BoundedEventQueue {
    config: EventQueueConfig,
    inner: Mutex<QueueInner>,
}

impl BoundedEventQueue {
    pub fn new(config: EventQueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                delayed: Vec::new(),
                in_flight: HashMap::new(),
                dlq: VecDeque::new(),
                seen_ids: HashSet::new(),
                seen_order: VecDeque::new(),
                stats: EventQueueStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EventQueueConfig::default())
    }

    pub fn config(&self) -> &EventQueueConfig {
        &self.config
    }

    /// Enqueue one event at the tail.
    pub async fn enqueue(&self, event: Event) -> RuntimeResult<EnqueueReceipt> {
        let mut inner = self.inner.lock().await;

        if self.config.enable_idempotency && inner.seen_ids.contains(&event.id) {
            return Err(RuntimeError::DuplicateEvent(event.id.to_string()));
        }
        if inner.depth() >= self.config.queue_size {
            return Err(RuntimeError::QueueFull {
                capacity: self.config.queue_size,
            });
        }

        let id = event.id;
        inner.pending.push_back((event, 0));
        inner.remember(id, self.config.dedup_capacity);
        inner.stats.total_enqueued += 1;
        Ok(EnqueueReceipt { queued: true })
    }

    /// Dequeue up to `n` events, FIFO, skipping any thread that already
    /// has an in-flight event.
    pub async fn dequeue_batch(&self, n: usize) -> Vec<Event> {
        let n = n.min(self.config.batch_size);
        let mut inner = self.inner.lock().await;
        inner.promote_ready(Instant::now());

        let mut batch = Vec::with_capacity(n);
        let mut busy_threads: HashSet<String> = inner
            .in_flight
            .values()
            .map(|e| e.event.thread_id.clone())
            .collect();

        let mut remaining: VecDeque<(Event, u32)> = VecDeque::new();
        while let Some((event, attempts)) = inner.pending.pop_front() {
            if batch.len() >= n || busy_threads.contains(&event.thread_id) {
                remaining.push_back((event, attempts));
                continue;
            }
            busy_threads.insert(event.thread_id.clone());
            if self.config.enable_acks {
                inner.in_flight.insert(
                    event.id,
                    InFlightEntry {
                        event: event.clone(),
                        attempts,
                    },
                );
            }
            batch.push(event);
        }
        inner.pending = remaining;
        batch
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self, event_id: EventId) -> RuntimeResult<()> {
        if !self.config.enable_acks {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if inner.in_flight.remove(&event_id).is_some() {
            inner.stats.total_acked += 1;
            Ok(())
        } else {
            debug!(%event_id, "ack for unknown in-flight event");
            Ok(())
        }
    }

    /// Negative-acknowledge: reschedule with capped exponential backoff,
    /// or dead-letter once retries are exhausted.
    pub async fn nack(&self, event_id: EventId, error: Option<String>) -> RuntimeResult<()> {
        self.nack_inner(event_id, error, true).await
    }

    /// NACK without retry; the event goes straight to the DLQ.
    pub async fn nack_non_retryable(
        &self,
        event_id: EventId,
        error: Option<String>,
    ) -> RuntimeResult<()> {
        self.nack_inner(event_id, error, false).await
    }

    async fn nack_inner(
        &self,
        event_id: EventId,
        error: Option<String>,
        retryable: bool,
    ) -> RuntimeResult<()> {
        if !self.config.enable_acks {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.in_flight.remove(&event_id) else {
            debug!(%event_id, "nack for unknown in-flight event");
            return Ok(());
        };
        inner.stats.total_nacked += 1;

        let attempts = entry.attempts + 1;
        if retryable && attempts <= self.config.max_retries {
            let backoff = self.backoff_for(attempts);
            inner.delayed.push(DelayedEntry {
                event: entry.event,
                attempts,
                ready_at: Instant::now() + backoff,
            });
        } else {
            warn!(%event_id, attempts, error = error.as_deref().unwrap_or(""), "event dead-lettered");
            inner.stats.total_dead_lettered += 1;
            inner.dlq.push_back(DeadLetter {
                event: entry.event,
                error,
                attempts,
                dead_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Exponential backoff for the nth retry, capped.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .config
            .retry_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Re-enqueue dead letters matching the criteria at the tail.
    pub async fn reprocess_dlq_by_criteria(
        &self,
        criteria: ReprocessCriteria,
    ) -> RuntimeResult<ReprocessResult> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let limit = criteria.limit.unwrap_or(usize::MAX);

        let mut kept: VecDeque<DeadLetter> = VecDeque::new();
        let mut reprocessed: Vec<Event> = Vec::new();

        while let Some(letter) = inner.dlq.pop_front() {
            let matches_age = criteria.max_age.is_none_or(|max_age| {
                (now - letter.dead_at).to_std().unwrap_or_default() <= max_age
            });
            let matches_type = criteria
                .event_type
                .as_deref()
                .is_none_or(|t| letter.event.event_type.as_str() == t);

            if reprocessed.len() < limit
                && matches_age
                && matches_type
                && inner.depth() < self.config.queue_size
            {
                reprocessed.push(letter.event.clone());
                inner.pending.push_back((letter.event, 0));
            } else {
                kept.push_back(letter);
            }
        }
        inner.dlq = kept;

        Ok(ReprocessResult {
            reprocessed_count: reprocessed.len(),
            events: reprocessed,
        })
    }

    /// Current dead letters, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        let inner = self.inner.lock().await;
        inner.dlq.iter().cloned().collect()
    }

    /// NACK everything still in flight. Called on shutdown or cancel so
    /// retries survive the next start when a persistent DLQ is wired up.
    pub async fn nack_all_in_flight(&self, error: impl Into<String>, retryable: bool) {
        let ids: Vec<EventId> = {
            let inner = self.inner.lock().await;
            inner.in_flight.keys().copied().collect()
        };
        let error = error.into();
        for id in ids {
            let result = if retryable {
                self.nack(id, Some(error.clone())).await
            } else {
                self.nack_non_retryable(id, Some(error.clone())).await
            };
            if let Err(e) = result {
                warn!(%id, error = %e, "failed to nack in-flight event on shutdown");
            }
        }
    }

    pub async fn stats(&self) -> EventQueueStats {
        let inner = self.inner.lock().await;
        EventQueueStats {
            pending: inner.pending.len(),
            scheduled_retries: inner.delayed.len(),
            in_flight: inner.in_flight.len(),
            dead_letters: inner.dlq.len(),
            ..inner.stats.clone()
        }
    }

    /// Total queued depth (pending + scheduled retries).
    pub async fn depth(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.depth()
    }

    /// Whether nothing is queued or in flight.
    pub async fn is_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.depth() == 0 && inner.in_flight.is_empty()
    }
}
