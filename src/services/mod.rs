//! Runtime services for the arbiter kernel system.

pub mod agent_runtime;
pub mod circuit_breaker;
pub mod context_store;
pub mod event_processor;
pub mod event_queue;
pub mod handler_registry;
pub mod kernel;
pub mod loop_protector;
pub mod middleware;
pub mod multi_kernel;
pub mod plan_executor;
pub mod planner;

pub use agent_runtime::{AgentRuntime, GoalRunResult};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use context_store::{ContextCacheStats, ContextStore, ContextStoreConfig, ContextStoreStats};
pub use event_processor::{EventProcessor, EventProcessorConfig, EventProcessorStats};
pub use event_queue::{
    BoundedEventQueue, DeadLetter, EnqueueReceipt, EventQueueConfig, EventQueueStats,
    ReprocessCriteria, ReprocessResult,
};
pub use handler_registry::{
    EventHandler, FnHandler, HandlerId, HandlerRecord, HandlerRegistry, HandlerRegistryConfig,
    HandlerRegistryStats,
};
pub use kernel::{
    EmitOptions, EmitReceipt, Kernel, KernelConfig, KernelStats, OperationIsolation,
    OperationOptions, DEFAULT_TIMEOUT_MS,
};
pub use loop_protector::{LoopProtector, LoopProtectorConfig, LoopProtectorStats};
pub use middleware::{
    ChainResult, ConcurrencyKey, ConcurrencyMiddleware, Conditional, Middleware, MiddlewareChain,
    MiddlewareError, MiddlewareKind, MiddlewareSpec, Next, ObservabilityMiddleware,
    RequiredKeysValidator, RetryConfig, RetryMiddleware, SchemaValidator, TimeoutMiddleware,
    ValidationMiddleware,
};
pub use multi_kernel::{
    BridgeSpec, BridgeTransform, CrossKernelRecord, KernelSpec, KernelStatusReport, ManagerStatus,
    MultiKernelConfig, MultiKernelManager, PerformanceSpec,
};
pub use plan_executor::{
    analyze_step_result, matches_replan_trigger, ExecutorEvent, PlanExecutor, PlanExecutorConfig,
    StepAnalysis, REPLAN_TRIGGERS,
};
pub use planner::{
    extract_json_from_response, DirectApiAdapter, PlanAndExecutePlanner, PlannerConfig,
};
