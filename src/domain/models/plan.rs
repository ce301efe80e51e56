//! Execution plans: dependency-ordered steps produced by a planner and
//! driven by the executor.
//!
//! Steps live in an arena (`Vec<PlanStep>`) addressed by id strings;
//! dependencies reference earlier steps only, which keeps the graph
//! acyclic by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::action::ActionResult;

/// Step bound to no tool: description-only / final step.
pub const TOOL_NONE: &str = "none";

/// Lifecycle of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Executing,
    WaitingInput,
    Completed,
    Failed,
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

/// One unit of plan execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Kebab-case id, unique within the plan.
    pub id: String,
    pub description: String,
    /// Registered tool name, or [`TOOL_NONE`] / absent for description-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Ids of earlier steps that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: None,
            arguments: None,
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            result: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Whether this step invokes a tool at all.
    pub fn has_tool(&self) -> bool {
        match self.tool.as_deref() {
            None => false,
            Some(t) => t != TOOL_NONE,
        }
    }
}

/// Planner-produced hints reported back verbatim on the next planning turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSignals {
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub no_discovery_path: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_next_step: Option<String>,
}

impl PlanSignals {
    /// Whether any hint is present; any hint forces a replan.
    pub fn has_problems(&self) -> bool {
        !self.needs.is_empty()
            || !self.no_discovery_path.is_empty()
            || !self.errors.is_empty()
            || self.suggested_next_step.is_some()
    }
}

/// Plan metadata; currently only signals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<PlanSignals>,
}

/// A dependency-ordered list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    /// Planning strategy that produced this plan (e.g. `plan_and_execute`).
    pub strategy: String,
    pub status: PlanStatus,
    pub current_step_index: usize,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

impl ExecutionPlan {
    pub fn new(id: impl Into<String>, strategy: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: id.into(),
            strategy: strategy.into(),
            status: PlanStatus::Pending,
            current_step_index: 0,
            steps,
            metadata: PlanMetadata::default(),
        }
    }

    pub fn with_signals(mut self, signals: PlanSignals) -> Self {
        self.metadata.signals = Some(signals);
        self
    }

    /// Validate the plan structure: unique kebab-case step ids and
    /// dependencies referencing earlier steps only (which rules out
    /// cycles).
    pub fn validate(&self, registered_tools: &HashSet<String>) -> RuntimeResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if !is_kebab_case(&step.id) {
                return Err(RuntimeError::PlanValidation(format!(
                    "step id '{}' is not kebab-case",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(RuntimeError::PlanValidation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if let Some(tool) = step.tool.as_deref() {
                if tool != TOOL_NONE && !registered_tools.contains(tool) {
                    return Err(RuntimeError::PlanValidation(format!(
                        "step '{}' references unregistered tool '{tool}'",
                        step.id
                    )));
                }
            }
            for dep in &step.dependencies {
                let dep_index = self.steps.iter().position(|s| &s.id == dep);
                match dep_index {
                    None => {
                        return Err(RuntimeError::PlanValidation(format!(
                            "step '{}' depends on unknown step '{dep}'",
                            step.id
                        )));
                    }
                    Some(d) if d >= index => {
                        return Err(RuntimeError::PlanValidation(format!(
                            "step '{}' depends on later step '{dep}'",
                            step.id
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Steps whose dependencies have all completed.
    pub fn ready_steps(&self) -> Vec<String> {
        let completed: HashSet<&str> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.as_str())
            .collect();

        self.steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Pending
                    && s.dependencies.iter().all(|d| completed.contains(d.as_str()))
            })
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Index of the first pending step, or the step count if none.
    pub fn first_pending_index(&self) -> usize {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)
            .unwrap_or(self.steps.len())
    }
}

fn is_kebab_case(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && !id.ends_with('-')
        && !id.contains("--")
        && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Result of executing a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: String,
    pub step: PlanStep,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Terminal classification of a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    ExecutionComplete,
    NeedsReplan,
    Deadlock,
}

impl PlanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionComplete => "execution_complete",
            Self::NeedsReplan => "needs_replan",
            Self::Deadlock => "deadlock",
        }
    }
}

/// Structured data handed back to the planner when a replan is needed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplanContext {
    /// Successful step results worth keeping across a replan.
    pub preserved_steps: Vec<StepExecutionResult>,
    /// Deduped, lowercased error strings observed this run.
    pub failure_patterns: Vec<String>,
    /// Human-readable primary failure cause.
    pub primary_cause: String,
    /// Strategy hint for the next plan.
    pub suggested_strategy: String,
    /// Free-form context forwarded to the planner.
    pub context_for_replan: HashMap<String, Value>,
}

/// Aggregate outcome of one executor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecutionResult {
    #[serde(rename = "type")]
    pub outcome: PlanOutcome,
    pub plan_id: String,
    pub strategy: String,
    pub total_steps: usize,
    pub executed_steps: Vec<StepExecutionResult>,
    pub successful_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub has_signals_problems: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<PlanSignals>,
    pub execution_time_ms: u64,
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replan_context: Option<ReplanContext>,
}
