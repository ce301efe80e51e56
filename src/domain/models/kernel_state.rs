//! Per-tenant kernel state and quota model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};

/// Lifecycle status of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
}

impl KernelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether this status can transition to `next`.
    ///
    /// `initialized → running → paused → running …`,
    /// `running/paused → completed`, any → `failed`.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initialized, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Paused, Self::Completed)
                | (_, Self::Failed)
        )
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resource quotas enforced per kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelQuotas {
    /// Maximum number of processed events before the kernel pauses itself.
    pub max_events: u64,
    /// Maximum wall-clock run duration in milliseconds.
    pub max_duration_ms: u64,
    /// Maximum process memory in bytes.
    pub max_memory_bytes: u64,
}

impl Default for KernelQuotas {
    fn default() -> Self {
        Self {
            max_events: 1_000,
            max_duration_ms: 300_000,
            max_memory_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Auto-snapshot cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSnapshotConfig {
    /// Snapshot every N milliseconds while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Snapshot every N processed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_interval: Option<u64>,
    /// Opt snapshots into delta compression.
    #[serde(default = "default_use_delta")]
    pub use_delta: bool,
}

fn default_use_delta() -> bool {
    true
}

/// Serializable execution state of a kernel.
///
/// `context_data` holds `namespace → key → value` for the owning tenant;
/// `BTreeMap` keeps snapshot hashing independent of insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelState {
    /// `tenant_id:job_id`.
    pub id: String,
    pub tenant_id: String,
    pub correlation_id: Uuid,
    pub job_id: String,
    pub context_data: BTreeMap<String, BTreeMap<String, Value>>,
    pub state_data: BTreeMap<String, Value>,
    pub status: KernelStatus,
    pub start_time: DateTime<Utc>,
    pub event_count: u64,
    pub quotas: KernelQuotas,
    /// In-flight atomic operation ids blocking duplicate submissions.
    pub pending_operations: HashSet<String>,
}

impl KernelState {
    pub fn new(tenant_id: impl Into<String>, job_id: impl Into<String>, quotas: KernelQuotas) -> Self {
        let tenant_id = tenant_id.into();
        let job_id = job_id.into();
        Self {
            id: format!("{tenant_id}:{job_id}"),
            tenant_id,
            correlation_id: Uuid::new_v4(),
            job_id,
            context_data: BTreeMap::new(),
            state_data: BTreeMap::new(),
            status: KernelStatus::Initialized,
            start_time: Utc::now(),
            event_count: 0,
            quotas,
            pending_operations: HashSet::new(),
        }
    }

    /// Apply a status transition, rejecting illegal ones.
    pub fn transition(&mut self, next: KernelStatus) -> RuntimeResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(RuntimeError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Elapsed run time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.start_time).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(KernelStatus::Initialized.can_transition_to(KernelStatus::Running));
        assert!(KernelStatus::Running.can_transition_to(KernelStatus::Paused));
        assert!(KernelStatus::Paused.can_transition_to(KernelStatus::Running));
        assert!(KernelStatus::Running.can_transition_to(KernelStatus::Completed));
        assert!(KernelStatus::Paused.can_transition_to(KernelStatus::Completed));
        assert!(KernelStatus::Completed.can_transition_to(KernelStatus::Failed));

        assert!(!KernelStatus::Initialized.can_transition_to(KernelStatus::Paused));
        assert!(!KernelStatus::Completed.can_transition_to(KernelStatus::Running));
        assert!(!KernelStatus::Failed.can_transition_to(KernelStatus::Running));
    }

    #[test]
    fn test_state_id_composition() {
        let state = KernelState::new("acme", "job-7", KernelQuotas::default());
        assert_eq!(state.id, "acme:job-7");
        assert_eq!(state.status, KernelStatus::Initialized);
        assert_eq!(state.event_count, 0);
        assert!(state.pending_operations.is_empty());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut state = KernelState::new("acme", "job-1", KernelQuotas::default());
        let err = state.transition(KernelStatus::Paused).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE_TRANSITION");

        state.transition(KernelStatus::Running).unwrap();
        state.transition(KernelStatus::Paused).unwrap();
        state.transition(KernelStatus::Running).unwrap();
        state.transition(KernelStatus::Completed).unwrap();
    }

    #[test]
    fn test_default_quotas() {
        let quotas = KernelQuotas::default();
        assert_eq!(quotas.max_events, 1_000);
        assert_eq!(quotas.max_duration_ms, 300_000);
        assert_eq!(quotas.max_memory_bytes, 512 * 1024 * 1024);
    }
}
