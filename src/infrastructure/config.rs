//! Configuration loading with hierarchical merging.
//!
//! Precedence (lowest to highest): programmatic defaults, project YAML
//! (`.arbiter/config.yaml`), local overrides (`.arbiter/local.yaml`),
//! then `ARBITER_`-prefixed environment variables.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::kernel_state::{AutoSnapshotConfig, KernelQuotas};
use crate::services::circuit_breaker::CircuitBreakerConfig;
use crate::services::context_store::ContextStoreConfig;
use crate::services::event_processor::EventProcessorConfig;
use crate::services::event_queue::EventQueueConfig;
use crate::services::handler_registry::HandlerRegistryConfig;
use crate::services::kernel::KernelConfig;
use crate::services::loop_protector::LoopProtectorConfig;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid queue_size: {0}. Must be at least 1")]
    InvalidQueueSize(usize),

    #[error("Invalid batch_size: {0}. Must be at least 1")]
    InvalidBatchSize(usize),

    #[error(
        "Invalid backoff configuration: retry_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid max_event_depth: {0}. Must be at least 1")]
    InvalidEventDepth(usize),

    #[error("Invalid failure_rate_threshold: {0}. Must be within (0, 1]")]
    InvalidFailureRate(f64),

    #[error("Invalid slow_call_rate_threshold: {0}. Must be within (0, 1]")]
    InvalidSlowCallRate(f64),

    #[error("Invalid window_ms: {0}. Must be positive")]
    InvalidWindow(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub queue_size: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub enable_acks: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 100,
            max_retries: 3,
            retry_backoff_ms: 100,
            max_backoff_ms: 30_000,
            enable_acks: true,
        }
    }
}

/// Processor and handler-registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    pub max_event_depth: usize,
    pub max_event_chain_length: usize,
    pub cleanup_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub operation_timeout_ms: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_event_depth: 100,
            max_event_chain_length: 1_000,
            cleanup_interval_ms: 120_000,
            stale_threshold_ms: 600_000,
            operation_timeout_ms: 180_000,
        }
    }
}

/// Loop-protection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub enabled: bool,
    pub max_event_count: usize,
    pub max_event_rate: f64,
    pub window_ms: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_event_count: 100,
            max_event_rate: 50.0,
            window_ms: 5_000,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub request_volume_threshold: usize,
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub cooldown_period_ms: u64,
    pub success_threshold: u32,
    pub slow_call_duration_threshold_ms: u64,
    pub slow_call_rate_threshold: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.8,
            request_volume_threshold: 10,
            timeout_ms: 10_000,
            reset_timeout_ms: 30_000,
            cooldown_period_ms: 60_000,
            success_threshold: 3,
            slow_call_duration_threshold_ms: 5_000,
            slow_call_rate_threshold: 0.7,
        }
    }
}

/// Kernel quota and snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    pub max_events: u64,
    pub max_duration_ms: u64,
    pub max_memory_bytes: u64,
    pub auto_snapshot_interval_ms: Option<u64>,
    pub auto_snapshot_event_interval: Option<u64>,
    pub auto_snapshot_use_delta: bool,
    pub cache_size: usize,
    pub context_update_debounce_ms: u64,
    pub enable_event_idempotency: bool,
    pub enable_tenant_isolation: bool,
    pub max_concurrent_operations: usize,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            max_events: 1_000,
            max_duration_ms: 300_000,
            max_memory_bytes: 512 * 1024 * 1024,
            auto_snapshot_interval_ms: None,
            auto_snapshot_event_interval: None,
            auto_snapshot_use_delta: true,
            cache_size: 1_000,
            context_update_debounce_ms: 250,
            enable_event_idempotency: true,
            enable_tenant_isolation: false,
            max_concurrent_operations: 100,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    /// Optional log directory; when set, output also rotates to files.
    pub directory: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue: QueueSettings,
    pub processor: ProcessorSettings,
    pub loop_protection: LoopSettings,
    pub circuit_breaker: BreakerSettings,
    pub kernel: KernelSettings,
    pub logging: LoggingSettings,
}

impl RuntimeConfig {
    /// Build a per-kernel config from these settings.
    pub fn kernel_config(&self, tenant_id: &str, job_id: &str) -> KernelConfig {
        KernelConfig {
            tenant_id: tenant_id.to_string(),
            job_id: job_id.to_string(),
            quotas: KernelQuotas {
                max_events: self.kernel.max_events,
                max_duration_ms: self.kernel.max_duration_ms,
                max_memory_bytes: self.kernel.max_memory_bytes,
            },
            auto_snapshot: AutoSnapshotConfig {
                interval_ms: self.kernel.auto_snapshot_interval_ms,
                event_interval: self.kernel.auto_snapshot_event_interval,
                use_delta: self.kernel.auto_snapshot_use_delta,
            },
            enable_event_idempotency: self.kernel.enable_event_idempotency,
            enable_tenant_isolation: self.kernel.enable_tenant_isolation,
            max_concurrent_operations: self.kernel.max_concurrent_operations,
            operation_timeout_ms: self.processor.operation_timeout_ms,
            queue: EventQueueConfig {
                queue_size: self.queue.queue_size,
                batch_size: self.queue.batch_size,
                max_retries: self.queue.max_retries,
                retry_backoff_ms: self.queue.retry_backoff_ms,
                max_backoff_ms: self.queue.max_backoff_ms,
                enable_acks: self.queue.enable_acks,
                ..Default::default()
            },
            processor: EventProcessorConfig {
                max_event_depth: self.processor.max_event_depth,
                max_event_chain_length: self.processor.max_event_chain_length,
                batch_size: self.queue.batch_size,
                ..Default::default()
            },
            registry: HandlerRegistryConfig {
                cleanup_interval_ms: self.processor.cleanup_interval_ms,
                stale_threshold_ms: self.processor.stale_threshold_ms,
            },
            context: ContextStoreConfig {
                cache_size: self.kernel.cache_size,
                enable_batching: self.kernel.context_update_debounce_ms > 0,
                update_debounce_ms: self.kernel.context_update_debounce_ms.max(1),
            },
            loop_protection: LoopProtectorConfig {
                enabled: self.loop_protection.enabled,
                max_event_count: self.loop_protection.max_event_count,
                max_event_rate: self.loop_protection.max_event_rate,
                window_ms: self.loop_protection.window_ms,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.circuit_breaker.failure_threshold,
                failure_rate_threshold: self.circuit_breaker.failure_rate_threshold,
                request_volume_threshold: self.circuit_breaker.request_volume_threshold,
                timeout_ms: self.circuit_breaker.timeout_ms,
                reset_timeout_ms: self.circuit_breaker.reset_timeout_ms,
                cooldown_period_ms: self.circuit_breaker.cooldown_period_ms,
                success_threshold: self.circuit_breaker.success_threshold,
                slow_call_duration_threshold_ms: self.circuit_breaker.slow_call_duration_threshold_ms,
                slow_call_rate_threshold: self.circuit_breaker.slow_call_rate_threshold,
            },
            ..Default::default()
        }
    }
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from defaults, project files, and environment.
    pub fn load() -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(".arbiter/config.yaml"))
            .merge(Yaml::file(".arbiter/local.yaml"))
            .merge(Env::prefixed("ARBITER_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context("Failed to extract configuration from file")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Check value ranges that figment cannot express.
    pub fn validate(config: &RuntimeConfig) -> Result<(), ConfigError> {
        if config.queue.queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize(config.queue.queue_size));
        }
        if config.queue.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(config.queue.batch_size));
        }
        if config.queue.retry_backoff_ms >= config.queue.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.queue.retry_backoff_ms,
                config.queue.max_backoff_ms,
            ));
        }
        if config.processor.max_event_depth == 0 {
            return Err(ConfigError::InvalidEventDepth(config.processor.max_event_depth));
        }
        let rate = config.circuit_breaker.failure_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigError::InvalidFailureRate(rate));
        }
        let slow = config.circuit_breaker.slow_call_rate_threshold;
        if !(slow > 0.0 && slow <= 1.0) {
            return Err(ConfigError::InvalidSlowCallRate(slow));
        }
        if config.loop_protection.window_ms == 0 {
            return Err(ConfigError::InvalidWindow(config.loop_protection.window_ms));
        }
        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match config.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
        Ok(())
    }
}
