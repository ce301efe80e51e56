//! Event handler registry with exact, wildcard, and pattern buckets.
//!
//! Each registered handler carries activity bookkeeping; a background
//! sweeper prunes handlers that were deactivated or have not matched an
//! event within the stale threshold. The registry is an explicit
//! per-kernel object, never a process-wide singleton.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::Event;

/// Unique identifier for a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandlerId(pub Uuid);

impl HandlerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait for event handlers.
///
/// A handler may return a JSON value as its reaction; values that parse as
/// well-formed events are resubmitted through the processor fast path.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> RuntimeResult<Option<Value>>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = RuntimeResult<Option<Value>>> + Send,
{
    async fn handle(&self, event: &Event) -> RuntimeResult<Option<Value>> {
        (self.0)(event.clone()).await
    }
}

/// A registered handler plus its activity bookkeeping.
pub struct HandlerRecord {
    pub handler_id: HandlerId,
    pub handler: Arc<dyn EventHandler>,
    /// Registering tenant, if isolation is on.
    pub tenant_id: Option<String>,
    last_used_ms: AtomicU64,
    is_active: AtomicBool,
}

impl HandlerRecord {
    fn new(handler: Arc<dyn EventHandler>, tenant_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            handler_id: HandlerId::new(),
            handler,
            tenant_id,
            last_used_ms: AtomicU64::new(now_ms()),
            is_active: AtomicBool::new(true),
        })
    }

    /// Bump the last-used stamp; called on every dispatch.
    pub fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn deactivate(&self) {
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    fn is_stale(&self, now: u64, stale_threshold_ms: u64) -> bool {
        !self.is_active()
            || now.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)) > stale_threshold_ms
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Configuration for the registry sweeper.
#[derive(Debug, Clone)]
pub struct HandlerRegistryConfig {
    /// Interval between sweep passes.
    pub cleanup_interval_ms: u64,
    /// Handlers unused longer than this are pruned.
    pub stale_threshold_ms: u64,
}

impl Default for HandlerRegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 120_000,
            stale_threshold_ms: 600_000,
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerRegistryStats {
    pub exact_handlers: usize,
    pub wildcard_handlers: usize,
    pub pattern_handlers: usize,
    pub total_swept: u64,
}

struct Buckets {
    exact: std::collections::HashMap<String, Vec<Arc<HandlerRecord>>>,
    wildcard: Vec<Arc<HandlerRecord>>,
    patterns: Vec<(Regex, Vec<Arc<HandlerRecord>>)>,
    total_swept: u64,
}

/// Exact / wildcard / pattern handler map with stale-handler GC.
pub struct HandlerRegistry {
    config: HandlerRegistryConfig,
    buckets: RwLock<Buckets>,
}

impl HandlerRegistry {
    pub fn new(config: HandlerRegistryConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(Buckets {
                exact: std::collections::HashMap::new(),
                wildcard: Vec::new(),
                patterns: Vec::new(),
                total_swept: 0,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HandlerRegistryConfig::default())
    }

    /// Register a handler for one exact event type.
    pub async fn register_exact(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        tenant_id: Option<String>,
    ) -> HandlerId {
        let record = HandlerRecord::new(handler, tenant_id);
        let id = record.handler_id;
        let mut buckets = self.buckets.write().await;
        buckets.exact.entry(event_type.into()).or_default().push(record);
        id
    }

    /// Register a handler for every event.
    pub async fn register_wildcard(
        &self,
        handler: Arc<dyn EventHandler>,
        tenant_id: Option<String>,
    ) -> HandlerId {
        let record = HandlerRecord::new(handler, tenant_id);
        let id = record.handler_id;
        self.buckets.write().await.wildcard.push(record);
        id
    }

    /// Register a handler for types matching a regex.
    pub async fn register_pattern(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        tenant_id: Option<String>,
    ) -> RuntimeResult<HandlerId> {
        let regex = Regex::new(pattern)
            .map_err(|e| RuntimeError::ValidationFailed(format!("invalid pattern: {e}")))?;
        let record = HandlerRecord::new(handler, tenant_id);
        let id = record.handler_id;
        let mut buckets = self.buckets.write().await;
        if let Some((_, records)) = buckets.patterns.iter_mut().find(|(r, _)| r.as_str() == pattern) {
            records.push(record);
        } else {
            buckets.patterns.push((regex, vec![record]));
        }
        Ok(id)
    }

    /// All active handlers matching an event type: exact ∪ wildcard ∪
    /// matching patterns.
    pub async fn matching(&self, event_type: &str) -> Vec<Arc<HandlerRecord>> {
        let buckets = self.buckets.read().await;
        let mut out: Vec<Arc<HandlerRecord>> = Vec::new();

        if let Some(records) = buckets.exact.get(event_type) {
            out.extend(records.iter().filter(|r| r.is_active()).cloned());
        }
        out.extend(buckets.wildcard.iter().filter(|r| r.is_active()).cloned());
        for (regex, records) in &buckets.patterns {
            if regex.is_match(event_type) {
                out.extend(records.iter().filter(|r| r.is_active()).cloned());
            }
        }
        out
    }

    /// Mark a handler inactive; the sweeper removes it on its next pass.
    pub async fn deactivate(&self, handler_id: HandlerId) -> bool {
        let buckets = self.buckets.read().await;
        let record = buckets
            .exact
            .values()
            .flatten()
            .chain(buckets.wildcard.iter())
            .chain(buckets.patterns.iter().flat_map(|(_, rs)| rs.iter()))
            .find(|r| r.handler_id == handler_id);
        match record {
            Some(r) => {
                r.deactivate();
                true
            }
            None => false,
        }
    }

    /// One sweep pass; returns the number of handlers removed.
    pub async fn sweep(&self) -> usize {
        let now = now_ms();
        let threshold = self.config.stale_threshold_ms;
        let mut buckets = self.buckets.write().await;
        let mut removed = 0;

        buckets.exact.retain(|_, records| {
            records.retain(|r| {
                let stale = r.is_stale(now, threshold);
                removed += usize::from(stale);
                !stale
            });
            !records.is_empty()
        });
        buckets.wildcard.retain(|r| {
            let stale = r.is_stale(now, threshold);
            removed += usize::from(stale);
            !stale
        });
        buckets.patterns.retain_mut(|(_, records)| {
            records.retain(|r| {
                let stale = r.is_stale(now, threshold);
                removed += usize::from(stale);
                !stale
            });
            !records.is_empty()
        });

        buckets.total_swept += removed as u64;
        if removed > 0 {
            debug!(removed, "swept stale handlers");
        }
        removed
    }

    /// Spawn the periodic sweeper. Abort the handle on shutdown.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_millis(registry.config.cleanup_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    /// Remove every handler. Exposed for tests.
    pub async fn clear_handlers(&self) {
        let mut buckets = self.buckets.write().await;
        buckets.exact.clear();
        buckets.wildcard.clear();
        buckets.patterns.clear();
    }

    pub async fn stats(&self) -> HandlerRegistryStats {
        let buckets = self.buckets.read().await;
        HandlerRegistryStats {
            exact_handlers: buckets.exact.values().map(Vec::len).sum(),
            wildcard_handlers: buckets.wildcard.len(),
            pattern_handlers: buckets.patterns.iter().map(|(_, rs)| rs.len()).sum(),
            total_swept: buckets.total_swept,
        }
    }
}
