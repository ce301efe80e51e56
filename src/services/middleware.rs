//! Composable middleware chain around event handlers.
//!
//! A middleware wraps an `EventHandler` and yields an `EventHandler`;
//! composition is a right fold, so the first middleware in the sorted
//! chain is outermost. Pipeline middlewares (retry, timeout, concurrency)
//! wrap the whole invocation; handler middlewares (validation) wrap the
//! handler itself and run inside. Priorities are 0-100, lower runs first
//! within a kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info_span, Instrument};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::Event;
use crate::services::handler_registry::EventHandler;

/// Where in the chain a middleware sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareKind {
    /// Wraps the whole invocation (retry, timeout, concurrency).
    Pipeline,
    /// Wraps the handler itself (validation, transform).
    Handler,
}

/// Static description of a middleware.
#[derive(Debug, Clone)]
pub struct MiddlewareSpec {
    pub kind: MiddlewareKind,
    pub name: &'static str,
    /// 0-100; lower runs first within its kind.
    pub priority: u8,
}

/// Error produced when any layer of the chain fails.
///
/// Carries which middleware reported the failure, the wrapped original
/// error, how long the failing invocation ran, and the event involved.
#[derive(Debug)]
pub struct MiddlewareError {
    pub middleware: String,
    pub original: RuntimeError,
    pub execution_time: Duration,
    pub event_id: String,
    pub event_type: String,
}

impl std::fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "middleware '{}' failed after {:?} on {} ({}): {}",
            self.middleware, self.execution_time, self.event_type, self.event_id, self.original
        )
    }
}

impl std::error::Error for MiddlewareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.original)
    }
}

impl MiddlewareError {
    fn new(middleware: &str, original: RuntimeError, started: Instant, event: &Event) -> Self {
        Self {
            middleware: middleware.to_string(),
            original,
            execution_time: started.elapsed(),
            event_id: event.id.to_string(),
            event_type: event.event_type.as_str().to_string(),
        }
    }
}

/// Result type flowing through the chain.
pub type ChainResult = Result<Option<Value>, MiddlewareError>;

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn EventHandler,
}

impl<'a> Next<'a> {
    pub fn run(self, event: &'a Event) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((first, rest)) => {
                    let next = Next {
                        chain: rest,
                        terminal: self.terminal,
                    };
                    if first.applies(event) {
                        first.handle(event, next).await
                    } else {
                        next.run(event).await
                    }
                }
                None => {
                    let started = Instant::now();
                    self.terminal
                        .handle(event)
                        .await
                        .map_err(|e| MiddlewareError::new("handler", e, started, event))
                }
            }
        })
    }
}

/// A composable wrapper around event handlers.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn spec(&self) -> MiddlewareSpec;

    /// Conditional wrapper hook: when false the chain passes through.
    fn applies(&self, _event: &Event) -> bool {
        true
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> ChainResult;
}

/// Wraps any middleware with an extra predicate.
pub struct Conditional {
    inner: Arc<dyn Middleware>,
    predicate: Box<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl Conditional {
    pub fn new(
        inner: Arc<dyn Middleware>,
        predicate: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl Middleware for Conditional {
    fn spec(&self) -> MiddlewareSpec {
        self.inner.spec()
    }

    fn applies(&self, event: &Event) -> bool {
        (self.predicate)(event) && self.inner.applies(event)
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> ChainResult {
        self.inner.handle(event, next).await
    }
}

/// An ordered chain: pipeline middlewares outermost-in, handler
/// middlewares inside, then the terminal handler.
pub struct MiddlewareChain {
    ordered: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        let mut pipeline: Vec<Arc<dyn Middleware>> = Vec::new();
        let mut handler: Vec<Arc<dyn Middleware>> = Vec::new();
        for m in middlewares {
            match m.spec().kind {
                MiddlewareKind::Pipeline => pipeline.push(m),
                MiddlewareKind::Handler => handler.push(m),
            }
        }
        pipeline.sort_by_key(|m| m.spec().priority);
        handler.sort_by_key(|m| m.spec().priority);
        pipeline.extend(handler);
        Self { ordered: pipeline }
    }

    pub fn empty() -> Self {
        Self { ordered: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Names in execution order, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.ordered.iter().map(|m| m.spec().name).collect()
    }

    /// Run an event through the chain into the terminal handler.
    pub async fn execute(&self, event: &Event, terminal: &dyn EventHandler) -> ChainResult {
        Next {
            chain: &self.ordered,
            terminal,
        }
        .run(event)
        .await
    }
}

// ---------------------------------------------------------------------------
// Concrete middlewares
// ---------------------------------------------------------------------------

/// Opens a span per processed event and records failures on it.
pub struct ObservabilityMiddleware;

#[async_trait]
impl Middleware for ObservabilityMiddleware {
    fn spec(&self) -> MiddlewareSpec {
        MiddlewareSpec {
            kind: MiddlewareKind::Pipeline,
            name: "observability",
            priority: 10,
        }
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> ChainResult {
        let span = info_span!(
            "event.process",
            otel.name = %format!("event.process.{}", event.event_type),
            tenant_id = event.metadata.tenant_id.as_deref().unwrap_or(""),
            correlation_id = %event
                .metadata
                .correlation_id
                .map(|c| c.to_string())
                .unwrap_or_default(),
            thread_id = %event.thread_id,
            ts = event.ts,
        );
        let result = next.run(event).instrument(span).await;
        if let Err(ref e) = result {
            error!(
                event_type = %event.event_type,
                middleware = %e.middleware,
                error = %e.original,
                "event processing failed"
            );
        }
        result
    }
}

/// Configuration for [`RetryMiddleware`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Error codes that must not be retried.
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            non_retryable_errors: vec![
                "CANCELLED".into(),
                "VALIDATION_FAILED".into(),
                "EVENT_LOOP_DETECTED".into(),
                "DEPTH_EXCEEDED".into(),
            ],
        }
    }
}

/// Re-runs the inner chain with capped exponential backoff.
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.initial_backoff_ms),
            max_interval: Duration::from_millis(self.config.max_backoff_ms),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn spec(&self) -> MiddlewareSpec {
        MiddlewareSpec {
            kind: MiddlewareKind::Pipeline,
            name: "retry",
            priority: 20,
        }
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> ChainResult {
        let Next { chain, terminal } = next;
        let mut schedule = self.backoff();
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let result = Next { chain, terminal }.run(event).await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let code = e.original.code().to_string();
                    let exhausted = attempt >= self.config.max_attempts;
                    if exhausted || self.config.non_retryable_errors.contains(&code) {
                        return Err(e);
                    }
                    let delay = schedule
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.config.max_backoff_ms));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Races the inner chain against a deadline.
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn spec(&self) -> MiddlewareSpec {
        MiddlewareSpec {
            kind: MiddlewareKind::Pipeline,
            name: "timeout",
            priority: 30,
        }
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> ChainResult {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, next.run(event)).await {
            Ok(result) => result,
            Err(_) => Err(MiddlewareError::new(
                "timeout",
                RuntimeError::OperationTimeout {
                    operation_id: event.id.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                },
                started,
                event,
            )),
        }
    }
}

/// How the concurrency middleware keys its semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyKey {
    Thread,
    Tenant,
    EventType,
}

/// Per-key semaphore bound; saturated keys reject instead of queueing.
pub struct ConcurrencyMiddleware {
    max_concurrent: usize,
    key: ConcurrencyKey,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyMiddleware {
    pub fn new(max_concurrent: usize, key: ConcurrencyKey) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            key,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(&self, event: &Event) -> String {
        match self.key {
            ConcurrencyKey::Thread => event.thread_id.clone(),
            ConcurrencyKey::Tenant => event
                .metadata
                .tenant_id
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            ConcurrencyKey::EventType => event.event_type.as_str().to_string(),
        }
    }
}

#[async_trait]
impl Middleware for ConcurrencyMiddleware {
    fn spec(&self) -> MiddlewareSpec {
        MiddlewareSpec {
            kind: MiddlewareKind::Pipeline,
            name: "concurrency",
            priority: 40,
        }
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> ChainResult {
        let started = Instant::now();
        let key = self.key_for(event);
        let semaphore = {
            let mut map = self.semaphores.lock().await;
            Arc::clone(
                map.entry(key.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent))),
            )
        };

        let Ok(_permit) = semaphore.try_acquire() else {
            return Err(MiddlewareError::new(
                "concurrency",
                RuntimeError::ConcurrencyLimitExceeded {
                    key,
                    limit: self.max_concurrent,
                },
                started,
                event,
            ));
        };
        next.run(event).await
    }
}

/// Payload validation seam. The schema dialect is an adapter concern.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

/// Minimal validator requiring top-level keys to be present.
pub struct RequiredKeysValidator {
    pub keys: Vec<String>,
}

impl SchemaValidator for RequiredKeysValidator {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let Some(obj) = payload.as_object() else {
            return Err("payload is not an object".to_string());
        };
        for key in &self.keys {
            if !obj.contains_key(key) {
                return Err(format!("missing required key '{key}'"));
            }
        }
        Ok(())
    }
}

/// Validates the event payload before the handler runs. Failures are
/// non-retryable by design of the error code.
pub struct ValidationMiddleware {
    validator: Arc<dyn SchemaValidator>,
}

impl ValidationMiddleware {
    pub fn new(validator: Arc<dyn SchemaValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn spec(&self) -> MiddlewareSpec {
        MiddlewareSpec {
            kind: MiddlewareKind::Handler,
            name: "validation",
            priority: 50,
        }
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> ChainResult {
        let started = Instant::now();
        if let Err(reason) = self.validator.validate(&event.data) {
            return Err(MiddlewareError::new(
                "validation",
                RuntimeError::ValidationFailed(reason),
                started,
                event,
            ));
        }
        next.run(event).await
    }
}
