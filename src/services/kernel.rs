//! Per-tenant execution kernel.
//!
//! A kernel hosts its own queue, handler registry, processor, context
//! store, and persistor; enforces event/duration/memory quotas; runs all
//! state transitions through the atomic operation manager; and supports
//! pause/resume via content-addressed snapshots. Snapshots commit before
//! the kernel reports `paused`; resume reads a snapshot before new events
//! are accepted.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use sysinfo::{Pid, System};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::{Event, EventType, KernelNamespace};
use crate::domain::models::kernel_state::{
    AutoSnapshotConfig, KernelQuotas, KernelState, KernelStatus,
};
use crate::domain::models::snapshot::{stable_hash, Snapshot};
use crate::domain::ports::persistor::{AppendOptions, Persistor};
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::services::context_store::{ContextStore, ContextStoreConfig};
use crate::services::event_processor::{EventProcessor, EventProcessorConfig};
use crate::services::event_queue::{BoundedEventQueue, EventQueueConfig};
use crate::services::handler_registry::{
    EventHandler, HandlerId, HandlerRegistry, HandlerRegistryConfig,
};
use crate::services::loop_protector::{LoopProtector, LoopProtectorConfig};
use crate::services::middleware::MiddlewareChain;

/// Uniform default timeout for kernel operations.
pub const DEFAULT_TIMEOUT_MS: u64 = 180_000;

/// Bound on the remembered-operation set used for idempotent emission.
const SEEN_OPERATIONS_CAPACITY: usize = 50_000;

/// Configuration for one kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub tenant_id: String,
    pub job_id: String,
    /// Which event namespace this kernel serves.
    pub namespace: KernelNamespace,
    pub quotas: KernelQuotas,
    pub auto_snapshot: AutoSnapshotConfig,
    /// Short-circuit duplicate operation ids at emit.
    pub enable_event_idempotency: bool,
    /// Stamp events with the kernel tenant and reject cross-tenant
    /// handler registration.
    pub enable_tenant_isolation: bool,
    pub max_concurrent_operations: usize,
    pub operation_timeout_ms: u64,
    /// Whether snapshots are written at all (observability kernels skip
    /// them).
    pub needs_snapshots: bool,
    /// Poll cadence for duration/memory quota checks.
    pub quota_poll_interval_ms: u64,
    pub queue: EventQueueConfig,
    pub processor: EventProcessorConfig,
    pub registry: HandlerRegistryConfig,
    pub context: ContextStoreConfig,
    pub loop_protection: LoopProtectorConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            job_id: "job".to_string(),
            namespace: KernelNamespace::Agent,
            quotas: KernelQuotas::default(),
            auto_snapshot: AutoSnapshotConfig::default(),
            enable_event_idempotency: true,
            enable_tenant_isolation: false,
            max_concurrent_operations: 100,
            operation_timeout_ms: DEFAULT_TIMEOUT_MS,
            needs_snapshots: true,
            quota_poll_interval_ms: 250,
            queue: EventQueueConfig::default(),
            processor: EventProcessorConfig::default(),
            registry: HandlerRegistryConfig::default(),
            context: ContextStoreConfig::default(),
            loop_protection: LoopProtectorConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Options for [`Kernel::emit`].
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    /// Thread the event serializes on; defaults to the kernel job id.
    pub thread_id: Option<String>,
    /// Operation id for idempotent emission.
    pub operation_id: Option<String>,
    pub correlation_id: Option<uuid::Uuid>,
}

/// Result of an emit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitReceipt {
    pub success: bool,
    pub queued: bool,
}

/// Isolation level for atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationIsolation {
    /// Runs alongside other operations.
    #[default]
    Shared,
    /// Requires no other operation in flight.
    Exclusive,
}

/// Options for [`Kernel::execute_atomic_operation`].
#[derive(Debug, Clone, Copy)]
pub struct OperationOptions {
    pub timeout_ms: u64,
    pub isolation: OperationIsolation,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            isolation: OperationIsolation::Shared,
        }
    }
}

/// Kernel status report.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStats {
    pub id: String,
    pub status: &'static str,
    pub event_count: u64,
    pub elapsed_ms: u64,
    pub pending_operations: usize,
    pub queue: crate::services::event_queue::EventQueueStats,
    pub processor: crate::services::event_processor::EventProcessorStats,
    pub circuit: crate::services::circuit_breaker::CircuitBreakerStats,
    pub loop_protector: crate::services::loop_protector::LoopProtectorStats,
}

/// Per-tenant execution container.
pub struct Kernel {
    config: KernelConfig,
    state: RwLock<KernelState>,
    context: Arc<ContextStore>,
    registry: Arc<HandlerRegistry>,
    queue: Arc<BoundedEventQueue>,
    processor: Arc<EventProcessor>,
    persistor: Arc<dyn Persistor>,
    protector: Mutex<LoopProtector>,
    breaker: Mutex<CircuitBreaker>,
    cancel: CancellationToken,
    seen_operations: Mutex<(HashSet<String>, VecDeque<String>)>,
    last_operation_hash: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_snapshot_events: AtomicU64,
}

impl Kernel {
    pub fn new(config: KernelConfig, persistor: Arc<dyn Persistor>) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let context = Arc::new(ContextStore::new(config.context.clone()));
        let registry = Arc::new(HandlerRegistry::new(config.registry.clone()));
        let queue = Arc::new(BoundedEventQueue::new(config.queue.clone()));
        let processor = Arc::new(EventProcessor::new(
            config.processor.clone(),
            Arc::clone(&registry),
            Arc::clone(&queue),
            MiddlewareChain::empty(),
            cancel.clone(),
        ));
        Self::with_parts(config, persistor, context, registry, queue, processor, cancel)
    }

    /// Construct with an explicit middleware chain.
    pub fn with_middleware(
        config: KernelConfig,
        persistor: Arc<dyn Persistor>,
        chain: MiddlewareChain,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let context = Arc::new(ContextStore::new(config.context.clone()));
        let registry = Arc::new(HandlerRegistry::new(config.registry.clone()));
        let queue = Arc::new(BoundedEventQueue::new(config.queue.clone()));
        let processor = Arc::new(EventProcessor::new(
            config.processor.clone(),
            Arc::clone(&registry),
            Arc::clone(&queue),
            chain,
            cancel.clone(),
        ));
        Self::with_parts(config, persistor, context, registry, queue, processor, cancel)
    }

    fn with_parts(
        config: KernelConfig,
        persistor: Arc<dyn Persistor>,
        context: Arc<ContextStore>,
        registry: Arc<HandlerRegistry>,
        queue: Arc<BoundedEventQueue>,
        processor: Arc<EventProcessor>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let state = KernelState::new(&config.tenant_id, &config.job_id, config.quotas.clone());
        let protector = LoopProtector::new(config.loop_protection.clone());
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        Arc::new(Self {
            state: RwLock::new(state),
            context,
            registry,
            queue,
            processor,
            persistor,
            protector: Mutex::new(protector),
            breaker: Mutex::new(breaker),
            cancel,
            seen_operations: Mutex::new((HashSet::new(), VecDeque::new())),
            last_operation_hash: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            last_snapshot_events: AtomicU64::new(0),
            config,
        })
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.config.tenant_id, self.config.job_id)
    }

    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    pub fn namespace(&self) -> KernelNamespace {
        self.config.namespace
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<BoundedEventQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn status(&self) -> KernelStatus {
        self.state.read().await.status
    }

    /// Start workers and transition `initialized → running`.
    pub async fn initialize(self: &Arc<Self>) -> RuntimeResult<()> {
        {
            let mut state = self.state.write().await;
            state.transition(KernelStatus::Running)?;
        }
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.processor.start());
        tasks.push(self.registry.start_sweeper());
        if self.config.context.enable_batching {
            tasks.push(self.context.start_flusher());
        }
        tasks.push(self.start_quota_monitor());
        if self.config.needs_snapshots {
            if let Some(interval_ms) = self.config.auto_snapshot.interval_ms {
                tasks.push(self.start_auto_snapshot(interval_ms));
            }
        }
        info!(kernel = %self.id(), "kernel running");
        Ok(())
    }

    // -- Emission ----------------------------------------------------------

    /// Emit a business event into this kernel's queue.
    pub async fn emit(
        &self,
        event_type: &str,
        data: Value,
        options: EmitOptions,
    ) -> RuntimeResult<EmitReceipt> {
        {
            let state = self.state.read().await;
            if state.status != KernelStatus::Running {
                return Err(RuntimeError::InvalidStateTransition {
                    from: state.status.to_string(),
                    to: "emit".to_string(),
                });
            }
        }

        // Idempotent emit short-circuit.
        if self.config.enable_event_idempotency {
            if let Some(op_id) = options.operation_id.as_deref() {
                let seen = self.seen_operations.lock().await;
                if seen.0.contains(op_id) {
                    return Ok(EmitReceipt {
                        success: true,
                        queued: false,
                    });
                }
            }
        }

        // Loop protection is a hard gate.
        {
            let mut protector = self.protector.lock().await;
            protector.admit(event_type)?;
        }

        // Circuit breaker wraps the enqueue.
        {
            let mut breaker = self.breaker.lock().await;
            breaker.check()?;
        }

        let parsed = EventType::parse(event_type)?;
        // The operation manager tags every emission.
        let operation_id = options
            .operation_id
            .clone()
            .unwrap_or_else(|| format!("op-{}", uuid::Uuid::new_v4()));
        let thread_id = options
            .thread_id
            .unwrap_or_else(|| self.config.job_id.clone());

        let mut event = Event::new(parsed, thread_id, data).with_operation_id(&operation_id);
        if self.config.enable_tenant_isolation {
            event = event.with_tenant_id(&self.config.tenant_id);
        }
        if let Some(correlation_id) = options.correlation_id {
            event = event.with_correlation_id(correlation_id);
        }

        let started = Instant::now();
        let enqueued = self.queue.enqueue(event).await;
        let mut breaker = self.breaker.lock().await;
        match enqueued {
            Ok(receipt) => {
                breaker.record_success(started.elapsed());
                drop(breaker);
                self.remember_operation(operation_id).await;
                Ok(EmitReceipt {
                    success: true,
                    queued: receipt.queued,
                })
            }
            Err(e) => {
                breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn remember_operation(&self, operation_id: String) {
        if !self.config.enable_event_idempotency {
            return;
        }
        let mut seen = self.seen_operations.lock().await;
        if seen.0.insert(operation_id.clone()) {
            seen.1.push_back(operation_id);
            while seen.1.len() > SEEN_OPERATIONS_CAPACITY {
                if let Some(old) = seen.1.pop_front() {
                    seen.0.remove(&old);
                }
            }
        }
    }

    // -- Handler registration ---------------------------------------------

    /// Register an exact-type handler, enforcing tenant isolation.
    pub async fn register_handler(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        tenant_id: Option<String>,
    ) -> RuntimeResult<HandlerId> {
        self.check_tenant(tenant_id.as_deref())?;
        Ok(self
            .registry
            .register_exact(event_type, handler, tenant_id)
            .await)
    }

    /// Register a wildcard handler, enforcing tenant isolation.
    pub async fn register_wildcard_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        tenant_id: Option<String>,
    ) -> RuntimeResult<HandlerId> {
        self.check_tenant(tenant_id.as_deref())?;
        Ok(self.registry.register_wildcard(handler, tenant_id).await)
    }

    /// Register a pattern handler, enforcing tenant isolation.
    pub async fn register_pattern_handler(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        tenant_id: Option<String>,
    ) -> RuntimeResult<HandlerId> {
        self.check_tenant(tenant_id.as_deref())?;
        self.registry.register_pattern(pattern, handler, tenant_id).await
    }

    fn check_tenant(&self, tenant_id: Option<&str>) -> RuntimeResult<()> {
        if self.config.enable_tenant_isolation {
            if let Some(tenant) = tenant_id {
                if tenant != self.config.tenant_id {
                    return Err(RuntimeError::TenantIsolation(format!(
                        "handler registration from tenant '{tenant}' rejected by kernel of '{}'",
                        self.config.tenant_id
                    )));
                }
            }
        }
        Ok(())
    }

    // -- Context -----------------------------------------------------------

    pub async fn set_context(&self, namespace: &str, key: &str, value: Value) {
        self.context
            .set(&self.config.tenant_id, namespace, key, value)
            .await;
    }

    pub async fn get_context(&self, namespace: &str, key: &str) -> Option<Value> {
        self.context.get(&self.config.tenant_id, namespace, key).await
    }

    pub async fn increment_context(&self, namespace: &str, key: &str, delta: i64) -> i64 {
        self.context
            .increment(&self.config.tenant_id, namespace, key, delta)
            .await
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    // -- Atomic operations --------------------------------------------------

    /// Run `operation` under the atomic operation manager.
    ///
    /// Duplicate in-flight ids and operations beyond the concurrency bound
    /// are rejected up front; the future races the configured timeout; the
    /// result hash is published before the pending entry is cleared.
    pub async fn execute_atomic_operation<F, Fut>(
        &self,
        operation_id: &str,
        operation: F,
        options: OperationOptions,
    ) -> RuntimeResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RuntimeResult<Value>>,
    {
        {
            let mut state = self.state.write().await;
            if state.pending_operations.contains(operation_id) {
                return Err(RuntimeError::DuplicateOperation(operation_id.to_string()));
            }
            if state.pending_operations.len() >= self.config.max_concurrent_operations {
                return Err(RuntimeError::TooManyOperations {
                    pending: state.pending_operations.len(),
                    max: self.config.max_concurrent_operations,
                });
            }
            if options.isolation == OperationIsolation::Exclusive
                && !state.pending_operations.is_empty()
            {
                return Err(RuntimeError::TooManyOperations {
                    pending: state.pending_operations.len(),
                    max: 0,
                });
            }
            state.pending_operations.insert(operation_id.to_string());
        }

        let timeout = Duration::from_millis(options.timeout_ms);
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, operation()) => match result {
                Ok(inner) => inner,
                Err(_) => Err(RuntimeError::OperationTimeout {
                    operation_id: operation_id.to_string(),
                    timeout_ms: options.timeout_ms,
                }),
            },
            () = self.cancel.cancelled() => {
                Err(RuntimeError::Cancelled(format!("operation {operation_id}")))
            }
        };

        // Publish the result hash before clearing the pending entry.
        if let Ok(ref result) = outcome {
            let body = json!({
                "operation_id": operation_id,
                "result": result,
                "ts": chrono::Utc::now().timestamp_millis(),
            });
            if let Ok(hash) = stable_hash(&[], &body) {
                *self.last_operation_hash.lock().await = Some(hash);
            }
        }

        {
            let mut state = self.state.write().await;
            state.pending_operations.remove(operation_id);
        }
        outcome
    }

    pub async fn last_operation_hash(&self) -> Option<String> {
        self.last_operation_hash.lock().await.clone()
    }

    // -- Snapshots ----------------------------------------------------------

    /// Flush context, freeze state, persist a snapshot, then transition to
    /// `paused`. Returns the snapshot hash.
    pub async fn pause(&self, reason: &str) -> RuntimeResult<String> {
        let hash = self.write_snapshot().await?;
        {
            let mut state = self.state.write().await;
            state.transition(KernelStatus::Paused)?;
        }
        info!(kernel = %self.id(), reason, hash = %hash, "kernel paused");
        Ok(hash)
    }

    /// Capture a snapshot of current state without pausing.
    async fn write_snapshot(&self) -> RuntimeResult<String> {
        self.context.flush().await;
        let context_data = self.context.project_tenant(&self.config.tenant_id).await;

        let state_value = {
            let mut state = self.state.write().await;
            state.context_data = context_data;
            state.event_count = self.processor.stats().processed;
            serde_json::to_value(&*state)?
        };

        let snapshot = Snapshot::capture(self.id(), state_value, Vec::new())?;
        let hash = snapshot.hash.clone();
        self.persistor
            .append(
                &snapshot,
                AppendOptions {
                    use_delta: self.config.auto_snapshot.use_delta,
                },
            )
            .await?;
        self.last_snapshot_events
            .store(self.processor.stats().processed, Ordering::Relaxed);
        Ok(hash)
    }

    /// Load a snapshot, swap state atomically, clear the context cache,
    /// and re-enter `running`. On a missing hash the kernel stays paused.
    pub async fn resume(&self, hash: &str) -> RuntimeResult<()> {
        let snapshot = self
            .persistor
            .get_by_hash(hash)
            .await?
            .ok_or_else(|| RuntimeError::SnapshotNotFound(hash.to_string()))?;

        let mut restored: KernelState = serde_json::from_value(snapshot.state)?;
        restored.status = KernelStatus::Paused;

        self.context
            .restore_tenant(&self.config.tenant_id, restored.context_data.clone())
            .await;
        self.context.clear_cache().await;
        {
            let mut state = self.state.write().await;
            *state = restored;
            state.transition(KernelStatus::Running)?;
        }
        self.protector.lock().await.reset();
        info!(kernel = %self.id(), hash, "kernel resumed");
        Ok(())
    }

    /// Re-enter `running` without restoring state. Used for kernels that
    /// do not snapshot (fire-and-forget observability kernels).
    pub async fn resume_without_snapshot(&self) -> RuntimeResult<()> {
        {
            let mut state = self.state.write().await;
            state.transition(KernelStatus::Running)?;
        }
        self.protector.lock().await.reset();
        Ok(())
    }

    /// Finish the job: flush context and transition to `completed`.
    pub async fn complete(&self) -> RuntimeResult<()> {
        self.context.flush().await;
        {
            let mut state = self.state.write().await;
            state.transition(KernelStatus::Completed)?;
        }
        self.shutdown_workers(true).await;
        Ok(())
    }

    /// Transition to `failed`, cancel pending operations and workers.
    pub async fn fail(&self, reason: &str) {
        warn!(kernel = %self.id(), reason, "kernel failed");
        {
            let mut state = self.state.write().await;
            let _ = state.transition(KernelStatus::Failed);
            state.pending_operations.clear();
        }
        self.cancel.cancel();
        self.queue
            .nack_all_in_flight(RuntimeError::Cancelled(reason.to_string()).to_string(), false)
            .await;
        self.abort_tasks().await;
    }

    /// Orderly shutdown: in-flight events are NACKed retryable so they
    /// survive the next start when a persistent DLQ is configured.
    pub async fn shutdown(&self) {
        self.shutdown_workers(true).await;
    }

    async fn shutdown_workers(&self, retryable: bool) {
        self.cancel.cancel();
        self.queue.nack_all_in_flight("shutdown", retryable).await;
        self.abort_tasks().await;
    }

    async fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    // -- Quota enforcement ---------------------------------------------------

    fn start_quota_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(kernel.config.quota_poll_interval_ms.max(10));
            let mut system = System::new();
            let pid = sysinfo::get_current_pid().ok();
            loop {
                tokio::select! {
                    () = kernel.cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                if kernel.status().await != KernelStatus::Running {
                    continue;
                }
                if let Some(quota) = kernel.breached_quota(&mut system, pid).await {
                    kernel.handle_quota_breach(&quota).await;
                }
                kernel.maybe_auto_snapshot_by_events().await;
            }
        })
    }

    async fn breached_quota(&self, system: &mut System, pid: Option<Pid>) -> Option<String> {
        let quotas = self.config.quotas.clone();
        let processed = self.processor.stats().processed;
        if processed >= quotas.max_events {
            return Some("max_events".to_string());
        }

        let elapsed = self.state.read().await.elapsed_ms();
        if elapsed >= quotas.max_duration_ms {
            return Some("max_duration".to_string());
        }

        if let Some(pid) = pid {
            system.refresh_process(pid);
            if let Some(process) = system.process(pid) {
                if process.memory() >= quotas.max_memory_bytes {
                    return Some("max_memory".to_string());
                }
            }
        }
        None
    }

    async fn handle_quota_breach(&self, quota: &str) {
        warn!(kernel = %self.id(), quota, "quota exceeded, pausing kernel");
        let snapshot_hash = match self.pause(&format!("quota:{quota}")).await {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!(kernel = %self.id(), error = %e, "quota pause failed");
                None
            }
        };
        // Surface the breach to consumers; bypasses the emit gate because
        // the kernel is already paused.
        let event = Event::new(
            EventType::parse("agent.kernel.quota_exceeded").unwrap_or_else(|_| unreachable!()),
            self.config.job_id.clone(),
            json!({
                "kernel_id": self.id(),
                "quota": quota,
                "snapshot_hash": snapshot_hash,
            }),
        );
        if let Err(e) = self.queue.enqueue(event).await {
            warn!(kernel = %self.id(), error = %e, "failed to enqueue quota event");
        }
    }

    async fn maybe_auto_snapshot_by_events(&self) {
        if !self.config.needs_snapshots {
            return;
        }
        let Some(every) = self.config.auto_snapshot.event_interval else {
            return;
        };
        let processed = self.processor.stats().processed;
        let last = self.last_snapshot_events.load(Ordering::Relaxed);
        if processed.saturating_sub(last) >= every {
            if let Err(e) = self.write_snapshot().await {
                warn!(kernel = %self.id(), error = %e, "auto-snapshot failed");
            }
        }
    }

    fn start_auto_snapshot(self: &Arc<Self>, interval_ms: u64) -> JoinHandle<()> {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(interval_ms.max(10));
            loop {
                tokio::select! {
                    () = kernel.cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                if kernel.status().await == KernelStatus::Running {
                    if let Err(e) = kernel.write_snapshot().await {
                        warn!(kernel = %kernel.id(), error = %e, "auto-snapshot failed");
                    }
                }
            }
        })
    }

    // -- Status --------------------------------------------------------------

    pub async fn stats(&self) -> KernelStats {
        let state = self.state.read().await;
        KernelStats {
            id: state.id.clone(),
            status: state.status.as_str(),
            event_count: self.processor.stats().processed,
            elapsed_ms: state.elapsed_ms(),
            pending_operations: state.pending_operations.len(),
            queue: self.queue.stats().await,
            processor: self.processor.stats(),
            circuit: self.breaker.lock().await.stats(),
            loop_protector: self.protector.lock().await.stats(),
        }
    }

    /// The restored/current event count as recorded in kernel state.
    pub async fn event_count(&self) -> u64 {
        self.state.read().await.event_count
    }
}
