//! LLM adapter and planner ports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::action::AgentThought;
use crate::domain::models::plan::{PlanStep, ReplanContext, StepExecutionResult};

/// Reasoning technique a provider adapter can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanningTechnique {
    /// Chain-of-thought.
    Cot,
    /// Tree-of-thoughts.
    Tot,
    /// Reason + act interleaving.
    React,
    /// Observe-orient-decide-act.
    Ooda,
}

impl PlanningTechnique {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cot => "cot",
            Self::Tot => "tot",
            Self::React => "react",
            Self::Ooda => "ooda",
        }
    }

    pub fn parse(raw: &str) -> RuntimeResult<Self> {
        match raw.to_lowercase().as_str() {
            "cot" => Ok(Self::Cot),
            "tot" => Ok(Self::Tot),
            "react" => Ok(Self::React),
            "ooda" => Ok(Self::Ooda),
            other => Err(RuntimeError::Planner(format!(
                "unknown planning technique '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for PlanningTechnique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider identification reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
}

/// Opaque LLM provider adapter.
///
/// The adapter owns prompt construction details for its provider and
/// shapes raw output into the planner's `{reasoning, action}` form; the
/// executor never touches it directly.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Provider identification.
    fn get_provider(&self) -> ProviderInfo;

    /// Techniques this adapter can drive; planner strategies must match
    /// one of these.
    fn get_available_techniques(&self) -> Vec<PlanningTechnique>;

    /// Run one reasoning turn and shape the output.
    async fn generate_thought(&self, prompt: &str) -> RuntimeResult<AgentThought>;
}

/// One entry of the available-tools catalog handed to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: None,
        }
    }
}

/// Everything a planner sees when it thinks.
#[derive(Debug, Clone, Default)]
pub struct PlannerContext {
    /// User goal driving the run.
    pub goal: String,
    /// Tools the executor can dispatch to.
    pub available_tools: Vec<ToolSpec>,
    /// Results of steps executed so far (most recent run).
    pub execution_history: Vec<StepExecutionResult>,
    /// Structured failure context from the previous run, if replanning.
    pub replan_context: Option<ReplanContext>,
    /// How many replans the caller is still willing to pay for. The
    /// runtime never invents a budget; callers set it explicitly.
    pub replan_budget: Option<u32>,
    /// Free-form extra context.
    pub extra: HashMap<String, Value>,
}

/// Output of argument resolution for a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedArgs {
    pub args: Value,
    /// Argument keys the resolver could not fill.
    pub missing: Vec<String>,
}

/// Planning strategy port.
#[async_trait]
pub trait Planner: Send + Sync {
    /// One plan-act-observe reasoning turn.
    async fn think(&self, input: &str, context: &PlannerContext) -> RuntimeResult<AgentThought>;

    /// Resolve a step's raw arguments against prior step outputs.
    async fn resolve_args(
        &self,
        raw_args: &Value,
        steps: &[PlanStep],
        context: &PlannerContext,
    ) -> RuntimeResult<ResolvedArgs>;

    /// Compose the final user-facing response for a finished run.
    async fn create_final_response(&self, context: &PlannerContext) -> RuntimeResult<String>;
}
