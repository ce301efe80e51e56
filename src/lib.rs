//! Arbiter - Multi-Tenant Agent Execution Runtime
//!
//! Drives LLM-backed agents through a plan-act-observe loop on top of an
//! event-driven kernel system:
//! - Multi-kernel event bus with a namespace-filtered bridge
//! - Per-tenant kernels with quotas, idempotent atomic operations, and
//!   pause/resume via content-addressed snapshots
//! - Bounded event queue with ACK/NACK, retries, and a dead-letter queue
//! - Plan-and-execute engine with round-based dependency scheduling
//! - Loop protection and circuit breaking at every emit site

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{RuntimeError, RuntimeResult};
pub use domain::models::{Event, EventType, ExecutionPlan, KernelNamespace, Snapshot};
pub use services::{Kernel, KernelConfig, MultiKernelConfig, MultiKernelManager};
