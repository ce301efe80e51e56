//! Runtime errors for the arbiter kernel system.

use thiserror::Error;

/// Errors surfaced by the kernel runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("QUEUE_FULL: queue at capacity ({capacity})")]
    QueueFull { capacity: usize },

    #[error("DUPLICATE_EVENT: event {0} already enqueued")]
    DuplicateEvent(String),

    #[error("INFINITE_LOOP_DETECTED: {emitted} emits within {window_ms}ms window (max {max})")]
    LoopDetected {
        emitted: usize,
        max: usize,
        window_ms: u64,
    },

    #[error("CIRCUIT_OPEN: emission blocked until {retry_after_ms}ms elapse")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("DEPTH_EXCEEDED: processing depth {depth} exceeds max {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("EVENT_LOOP_DETECTED: type {event_type} already present in processing chain")]
    EventChainLoop { event_type: String },

    #[error("CONCURRENCY_LIMIT_EXCEEDED: key {key} saturated at {limit}")]
    ConcurrencyLimitExceeded { key: String, limit: usize },

    #[error("QUOTA_EXCEEDED: {quota} limit reached for kernel {kernel_id}")]
    QuotaExceeded { kernel_id: String, quota: String },

    #[error("SNAPSHOT_NOT_FOUND: no snapshot with hash {0}")]
    SnapshotNotFound(String),

    #[error("OPERATION_TIMEOUT: operation {operation_id} exceeded {timeout_ms}ms")]
    OperationTimeout {
        operation_id: String,
        timeout_ms: u64,
    },

    #[error("DUPLICATE_OPERATION: operation {0} already in flight")]
    DuplicateOperation(String),

    #[error("OPERATION_LIMIT: {pending} pending operations at max {max}")]
    TooManyOperations { pending: usize, max: usize },

    #[error("CANCELLED: {0}")]
    Cancelled(String),

    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("Request timed out waiting for {response_type} (correlation {correlation_id})")]
    RequestTimeout {
        response_type: String,
        correlation_id: String,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the crate.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    /// Short machine-readable code for status surfaces and NACK reasons.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::DuplicateEvent(_) => "DUPLICATE_EVENT",
            Self::LoopDetected { .. } => "INFINITE_LOOP_DETECTED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            Self::EventChainLoop { .. } => "EVENT_LOOP_DETECTED",
            Self::ConcurrencyLimitExceeded { .. } => "CONCURRENCY_LIMIT_EXCEEDED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::OperationTimeout { .. } => "OPERATION_TIMEOUT",
            Self::DuplicateOperation(_) => "DUPLICATE_OPERATION",
            Self::TooManyOperations { .. } => "OPERATION_LIMIT",
            Self::Cancelled(_) => "CANCELLED",
            Self::InvalidEventType(_) => "INVALID_EVENT_TYPE",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::TenantIsolation(_) => "TENANT_ISOLATION",
            Self::KernelNotFound(_) => "KERNEL_NOT_FOUND",
            Self::PlanValidation(_) => "PLAN_VALIDATION",
            Self::Planner(_) => "PLANNER_ERROR",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether a NACK carrying this error should be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled(_)
                | Self::DepthExceeded { .. }
                | Self::EventChainLoop { .. }
                | Self::ValidationFailed(_)
                | Self::DuplicateEvent(_)
                | Self::InvalidEventType(_)
                | Self::TenantIsolation(_)
        )
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for RuntimeError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = RuntimeError::QueueFull { capacity: 10 };
        assert_eq!(err.code(), "QUEUE_FULL");
        assert!(err.to_string().starts_with("QUEUE_FULL"));

        let err = RuntimeError::QuotaExceeded {
            kernel_id: "t1:j1".into(),
            quota: "max_events".into(),
        };
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn test_retryability() {
        assert!(!RuntimeError::Cancelled("shutdown".into()).is_retryable());
        assert!(!RuntimeError::EventChainLoop {
            event_type: "a.b".into()
        }
        .is_retryable());
        assert!(!RuntimeError::ValidationFailed("bad payload".into()).is_retryable());
        assert!(RuntimeError::OperationTimeout {
            operation_id: "op".into(),
            timeout_ms: 5
        }
        .is_retryable());
        assert!(RuntimeError::QueueFull { capacity: 1 }.is_retryable());
    }
}
