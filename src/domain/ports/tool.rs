//! Tool adapter port.

use async_trait::async_trait;

use crate::domain::errors::RuntimeResult;
use crate::domain::models::action::{ActionResult, AgentAction};

/// Dispatches planner actions to concrete tool implementations.
///
/// Adapters may return any [`ActionResult`] shape, including the wrapped
/// envelope; outcome classification happens in the plan executor.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn act(&self, action: AgentAction) -> RuntimeResult<ActionResult>;
}
