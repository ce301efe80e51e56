//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure concerns.

pub mod action;
pub mod event;
pub mod kernel_state;
pub mod plan;
pub mod snapshot;

pub use action::{
    ActionResult, AgentAction, AgentThought, DependentToolCall, EnvelopeContent, EnvelopePayload,
    EnvelopeResult, TaggedResult, ToolCall, ToolResultEntry, WrappedEnvelope,
};
pub use event::{as_reaction_event, Event, EventId, EventMetadata, EventType, KernelNamespace};
pub use kernel_state::{AutoSnapshotConfig, KernelQuotas, KernelState, KernelStatus};
pub use plan::{
    ExecutionPlan, PlanExecutionResult, PlanMetadata, PlanOutcome, PlanSignals, PlanStatus,
    PlanStep, ReplanContext, StepExecutionResult, StepStatus, TOOL_NONE,
};
pub use snapshot::{stable_hash, DeltaCodec, Snapshot, ZstdDeltaCodec, HASH_FORMAT_VERSION};
