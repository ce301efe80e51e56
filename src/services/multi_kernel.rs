//! Multi-kernel manager: owns N kernels, the namespace-filtered bridges
//! between them, and pause/resume fan-out.
//!
//! The agent kernel is durable (persistence, snapshots); the
//! observability kernel is fire-and-forget. The manager holds no mutable
//! state beyond the kernel registry, the bridge list, and a bounded
//! cross-kernel event log.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::{Event, EventId, EventType, KernelNamespace};
use crate::domain::models::kernel_state::{AutoSnapshotConfig, KernelQuotas, KernelStatus};
use crate::domain::ports::persistor::Persistor;
use crate::services::handler_registry::FnHandler;
use crate::services::kernel::{EmitOptions, EmitReceipt, Kernel, KernelConfig};

/// Maximum retained cross-kernel log entries.
const CROSS_LOG_CAPACITY: usize = 1_000;
/// How many recent entries status reports include.
const CROSS_LOG_STATUS_WINDOW: usize = 10;

/// Optional per-bridge event rewrite.
pub type BridgeTransform = Arc<dyn Fn(Event) -> Event + Send + Sync>;

/// Performance overrides for one kernel.
#[derive(Debug, Clone, Default)]
pub struct PerformanceSpec {
    pub queue_size: Option<usize>,
    pub batch_size: Option<usize>,
}

/// Declarative description of one kernel.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    pub kernel_id: String,
    pub namespace: KernelNamespace,
    /// Free-form workflow label carried through to status reports.
    pub workflow: String,
    pub needs_persistence: bool,
    pub needs_snapshots: bool,
    pub quotas: Option<KernelQuotas>,
    pub performance: Option<PerformanceSpec>,
}

impl KernelSpec {
    /// The standard agent kernel: durable, snapshotting, ACKed queue.
    pub fn agent(kernel_id: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            namespace: KernelNamespace::Agent,
            workflow: "agent".to_string(),
            needs_persistence: true,
            needs_snapshots: true,
            quotas: None,
            performance: None,
        }
    }

    /// The standard observability kernel: fire-and-forget.
    pub fn observability(kernel_id: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            namespace: KernelNamespace::Observability,
            workflow: "observability".to_string(),
            needs_persistence: false,
            needs_snapshots: false,
            quotas: None,
            performance: None,
        }
    }
}

/// One unidirectional propagation rule between kernel namespaces.
#[derive(Clone)]
pub struct BridgeSpec {
    pub from_namespace: KernelNamespace,
    pub to_namespace: KernelNamespace,
    /// `*`, `prefix.*`, or an exact type key.
    pub event_pattern: String,
    pub transform: Option<BridgeTransform>,
    pub enable_logging: bool,
}

impl std::fmt::Debug for BridgeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSpec")
            .field("from_namespace", &self.from_namespace)
            .field("to_namespace", &self.to_namespace)
            .field("event_pattern", &self.event_pattern)
            .field("has_transform", &self.transform.is_some())
            .field("enable_logging", &self.enable_logging)
            .finish()
    }
}

impl BridgeSpec {
    pub fn new(
        from_namespace: KernelNamespace,
        to_namespace: KernelNamespace,
        event_pattern: impl Into<String>,
    ) -> Self {
        Self {
            from_namespace,
            to_namespace,
            event_pattern: event_pattern.into(),
            transform: None,
            enable_logging: false,
        }
    }

    pub fn with_transform(mut self, transform: BridgeTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.enable_logging = true;
        self
    }

    /// `*` matches everything, `prefix.*` matches the prefix, anything
    /// else is an exact match.
    pub fn matches(&self, event_type: &str) -> bool {
        if self.event_pattern == "*" {
            return true;
        }
        if let Some(prefix) = self.event_pattern.strip_suffix(".*") {
            return event_type == prefix || event_type.starts_with(&format!("{prefix}."));
        }
        self.event_pattern == event_type
    }
}

/// Manager configuration: kernel specs plus bridges.
#[derive(Debug, Clone)]
pub struct MultiKernelConfig {
    pub tenant_id: String,
    pub job_id: String,
    pub kernels: Vec<KernelSpec>,
    pub bridges: Vec<BridgeSpec>,
    /// Base kernel settings; per-spec quotas/performance override it.
    pub kernel_defaults: KernelConfig,
}

impl MultiKernelConfig {
    /// The canonical two-kernel arrangement with an agent→observability
    /// bridge over the whole agent namespace.
    pub fn dual(tenant_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            job_id: job_id.into(),
            kernels: vec![KernelSpec::agent("agent"), KernelSpec::observability("observability")],
            bridges: vec![BridgeSpec::new(
                KernelNamespace::Agent,
                KernelNamespace::Observability,
                "agent.*",
            )],
            kernel_defaults: KernelConfig::default(),
        }
    }
}

/// One recorded cross-kernel propagation.
#[derive(Debug, Clone, Serialize)]
pub struct CrossKernelRecord {
    pub event_type: String,
    pub from: String,
    pub to: String,
    pub correlation_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

/// Registry entry; failed kernels stay listed so status stays accurate.
struct ManagedKernel {
    spec: KernelSpec,
    kernel: Option<Arc<Kernel>>,
    init_error: Option<String>,
}

/// Per-kernel entry of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatusReport {
    pub kernel_id: String,
    pub namespace: String,
    pub workflow: String,
    pub status: String,
    pub init_error: Option<String>,
}

/// Manager status report.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub kernels: Vec<KernelStatusReport>,
    pub recent_cross_kernel: Vec<CrossKernelRecord>,
}

/// Owns N kernels and the bridges between them.
pub struct MultiKernelManager {
    config: MultiKernelConfig,
    kernels: RwLock<HashMap<String, ManagedKernel>>,
    bridges: Vec<BridgeSpec>,
    cross_log: Mutex<VecDeque<CrossKernelRecord>>,
    persistor_for: Box<dyn Fn(&KernelSpec) -> Arc<dyn Persistor> + Send + Sync>,
}

impl MultiKernelManager {
    /// Build a manager; `persistor_for` supplies each kernel's snapshot
    /// store (typically the factory's cached adapters).
    pub fn new(
        config: MultiKernelConfig,
        persistor_for: impl Fn(&KernelSpec) -> Arc<dyn Persistor> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let bridges = config.bridges.clone();
        Arc::new(Self {
            config,
            kernels: RwLock::new(HashMap::new()),
            bridges,
            cross_log: Mutex::new(VecDeque::new()),
            persistor_for: Box::new(persistor_for),
        })
    }

    fn kernel_config_for(&self, spec: &KernelSpec) -> KernelConfig {
        let mut config = self.config.kernel_defaults.clone();
        config.tenant_id = self.config.tenant_id.clone();
        config.job_id = format!("{}:{}", self.config.job_id, spec.kernel_id);
        config.namespace = spec.namespace;
        config.needs_snapshots = spec.needs_snapshots;
        if let Some(quotas) = &spec.quotas {
            config.quotas = quotas.clone();
        }
        if let Some(perf) = &spec.performance {
            if let Some(queue_size) = perf.queue_size {
                config.queue.queue_size = queue_size;
            }
            if let Some(batch_size) = perf.batch_size {
                config.queue.batch_size = batch_size;
                config.processor.batch_size = batch_size;
            }
        }
        if spec.namespace == KernelNamespace::Observability {
            // Fire-and-forget: no ACK tracking, no snapshots.
            config.queue.enable_acks = false;
            config.auto_snapshot = AutoSnapshotConfig {
                interval_ms: None,
                event_interval: None,
                use_delta: false,
            };
        }
        config
    }

    /// Instantiate every kernel in parallel and wire the bridges. Kernels
    /// that fail to initialize remain registered with their error.
    pub async fn initialize(self: &Arc<Self>) -> RuntimeResult<()> {
        let specs = self.config.kernels.clone();
        let results = join_all(specs.iter().map(|spec| async {
            let kernel = Kernel::new(self.kernel_config_for(spec), (self.persistor_for)(spec));
            let init = kernel.initialize().await;
            (spec.clone(), kernel, init)
        }))
        .await;

        {
            let mut kernels = self.kernels.write().await;
            for (spec, kernel, init) in results {
                let entry = match init {
                    Ok(()) => ManagedKernel {
                        spec,
                        kernel: Some(kernel),
                        init_error: None,
                    },
                    Err(e) => {
                        warn!(kernel_id = %spec.kernel_id, error = %e, "kernel failed to initialize");
                        ManagedKernel {
                            spec,
                            kernel: None,
                            init_error: Some(e.to_string()),
                        }
                    }
                };
                kernels.insert(entry.spec.kernel_id.clone(), entry);
            }
        }

        self.install_bridges().await?;
        info!(kernels = self.config.kernels.len(), "multi-kernel manager initialized");
        Ok(())
    }

    /// Register the manager's wildcard bridge handler on every kernel.
    async fn install_bridges(self: &Arc<Self>) -> RuntimeResult<()> {
        let kernels = self.kernels.read().await;
        for entry in kernels.values() {
            let Some(kernel) = entry.kernel.as_ref() else {
                continue;
            };
            let manager = Arc::clone(self);
            let from_namespace = entry.spec.namespace;
            let from_id = entry.spec.kernel_id.clone();
            let handler = FnHandler(move |event: Event| {
                let manager = Arc::clone(&manager);
                let from_id = from_id.clone();
                async move {
                    manager.propagate(from_namespace, &from_id, event).await;
                    Ok(None)
                }
            });
            kernel
                .register_wildcard_handler(Arc::new(handler), None)
                .await?;
        }
        Ok(())
    }

    /// Forward one event across every matching bridge.
    async fn propagate(&self, from_namespace: KernelNamespace, from_id: &str, event: Event) {
        for bridge in &self.bridges {
            if bridge.from_namespace != from_namespace
                || !bridge.matches(event.event_type.as_str())
            {
                continue;
            }
            let Some(target) = self.kernel_for_namespace(bridge.to_namespace).await else {
                warn!(namespace = %bridge.to_namespace, "bridge target namespace has no kernel");
                continue;
            };

            // Fresh id; correlation id and payload are preserved.
            let mut forwarded = event.clone();
            forwarded.id = EventId::new();
            if let Some(transform) = &bridge.transform {
                forwarded = transform(forwarded);
            }

            if bridge.enable_logging {
                info!(
                    event_type = %forwarded.event_type,
                    from = %from_id,
                    to = %target.id(),
                    "bridging event"
                );
            }

            let correlation_id = forwarded.metadata.correlation_id;
            match target.queue().enqueue(forwarded.clone()).await {
                Ok(_) => {
                    let mut log = self.cross_log.lock().await;
                    log.push_back(CrossKernelRecord {
                        event_type: forwarded.event_type.as_str().to_string(),
                        from: from_id.to_string(),
                        to: target.id(),
                        correlation_id,
                        at: Utc::now(),
                    });
                    while log.len() > CROSS_LOG_CAPACITY {
                        log.pop_front();
                    }
                }
                Err(e) => {
                    warn!(error = %e, event_type = %forwarded.event_type, "bridge enqueue failed");
                }
            }
        }
    }

    /// The first ready kernel serving a namespace.
    pub async fn kernel_for_namespace(&self, namespace: KernelNamespace) -> Option<Arc<Kernel>> {
        let kernels = self.kernels.read().await;
        self.config
            .kernels
            .iter()
            .filter(|spec| spec.namespace == namespace)
            .find_map(|spec| kernels.get(&spec.kernel_id).and_then(|e| e.kernel.clone()))
    }

    pub async fn kernel(&self, kernel_id: &str) -> Option<Arc<Kernel>> {
        let kernels = self.kernels.read().await;
        kernels.get(kernel_id).and_then(|e| e.kernel.clone())
    }

    /// Emit a business event; the namespace encoded in the type key picks
    /// the kernel.
    pub async fn emit(
        &self,
        event_type: &str,
        data: Value,
        options: EmitOptions,
    ) -> RuntimeResult<EmitReceipt> {
        let namespace = EventType::parse(event_type)?.namespace();
        let kernel = self
            .kernel_for_namespace(namespace)
            .await
            .ok_or_else(|| RuntimeError::KernelNotFound(namespace.to_string()))?;
        kernel.emit(event_type, data, options).await
    }

    /// Pause every ready kernel. Only kernels with snapshots enabled
    /// report a hash.
    pub async fn pause_all(&self, reason: &str) -> HashMap<String, Option<String>> {
        let entries: Vec<(String, bool, Arc<Kernel>)> = {
            let kernels = self.kernels.read().await;
            kernels
                .values()
                .filter_map(|e| {
                    e.kernel
                        .clone()
                        .map(|k| (e.spec.kernel_id.clone(), e.spec.needs_snapshots, k))
                })
                .collect()
        };

        let mut out = HashMap::new();
        for (kernel_id, needs_snapshots, kernel) in entries {
            let hash = match kernel.pause(reason).await {
                Ok(hash) if needs_snapshots => Some(hash),
                Ok(_) => None,
                Err(e) => {
                    warn!(kernel_id = %kernel_id, error = %e, "pause failed");
                    None
                }
            };
            out.insert(kernel_id, hash);
        }
        out
    }

    /// Resume kernels from the hashes `pause_all` returned.
    pub async fn resume_all(&self, hashes: &HashMap<String, Option<String>>) -> RuntimeResult<()> {
        let entries: Vec<(String, Arc<Kernel>)> = {
            let kernels = self.kernels.read().await;
            kernels
                .values()
                .filter_map(|e| e.kernel.clone().map(|k| (e.spec.kernel_id.clone(), k)))
                .collect()
        };

        for (kernel_id, kernel) in entries {
            match hashes.get(&kernel_id) {
                Some(Some(hash)) => kernel.resume(hash).await?,
                // Snapshot-less kernels re-enter running without state.
                _ => {
                    if kernel.status().await == KernelStatus::Paused {
                        kernel.resume_without_snapshot().await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Request/response by correlation id: emits `request_type`, installs
    /// a one-shot handler for `response_type`, and resolves on the reply
    /// or times out.
    pub async fn request(
        &self,
        request_type: &str,
        response_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> RuntimeResult<Event> {
        let correlation_id = Uuid::new_v4();
        let namespace = EventType::parse(response_type)?.namespace();
        let kernel = self
            .kernel_for_namespace(namespace)
            .await
            .ok_or_else(|| RuntimeError::KernelNotFound(namespace.to_string()))?;

        let (tx, rx) = oneshot::channel::<Event>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let handler_slot = Arc::clone(&slot);
        let handler = FnHandler(move |event: Event| {
            let slot = Arc::clone(&handler_slot);
            async move {
                if event.metadata.correlation_id == Some(correlation_id) {
                    if let Some(sender) = slot.lock().await.take() {
                        let _ = sender.send(event);
                    }
                }
                Ok(None)
            }
        });
        let handler_id = kernel
            .register_handler(response_type, Arc::new(handler), None)
            .await?;

        let emit_result = self
            .emit(
                request_type,
                payload,
                EmitOptions {
                    correlation_id: Some(correlation_id),
                    ..Default::default()
                },
            )
            .await;

        let outcome = match emit_result {
            Ok(_) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(RuntimeError::RequestTimeout {
                    response_type: response_type.to_string(),
                    correlation_id: correlation_id.to_string(),
                }),
                Err(_) => Err(RuntimeError::RequestTimeout {
                    response_type: response_type.to_string(),
                    correlation_id: correlation_id.to_string(),
                }),
            },
            Err(e) => Err(e),
        };

        kernel.registry().deactivate(handler_id).await;
        outcome
    }

    /// Status report including failed kernels and the recent cross-kernel
    /// log window.
    pub async fn status(&self) -> ManagerStatus {
        let kernels = self.kernels.read().await;
        let mut reports = Vec::with_capacity(kernels.len());
        for entry in kernels.values() {
            let status = match (&entry.kernel, &entry.init_error) {
                (Some(kernel), _) => kernel.status().await.as_str().to_string(),
                (None, Some(_)) => "failed".to_string(),
                (None, None) => "initialized".to_string(),
            };
            reports.push(KernelStatusReport {
                kernel_id: entry.spec.kernel_id.clone(),
                namespace: entry.spec.namespace.to_string(),
                workflow: entry.spec.workflow.clone(),
                status,
                init_error: entry.init_error.clone(),
            });
        }
        reports.sort_by(|a, b| a.kernel_id.cmp(&b.kernel_id));

        let log = self.cross_log.lock().await;
        let recent = log
            .iter()
            .rev()
            .take(CROSS_LOG_STATUS_WINDOW)
            .cloned()
            .collect();

        ManagerStatus {
            kernels: reports,
            recent_cross_kernel: recent,
        }
    }

    /// Shut every kernel down. A failure in one kernel never cascades.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<Kernel>> = {
            let kernels = self.kernels.read().await;
            kernels.values().filter_map(|e| e.kernel.clone()).collect()
        };
        for kernel in entries {
            kernel.shutdown().await;
        }
    }
}
