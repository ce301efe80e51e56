//! Round-based plan executor.
//!
//! Runs ready steps in rounds, resolves step arguments against prior
//! outputs, classifies tool outcomes (including nested tool envelopes),
//! detects deadlocks, and builds the structured replan context handed
//! back to the planner. Per-step failures never abort a round; the round
//! budget guards against dependency-graph pathologies.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::errors::RuntimeResult;
use crate::domain::models::action::{
    ActionResult, AgentAction, EnvelopePayload, TaggedResult, WrappedEnvelope,
};
use crate::domain::models::plan::{
    ExecutionPlan, PlanExecutionResult, PlanOutcome, PlanStatus, PlanStep, ReplanContext,
    StepExecutionResult, StepStatus,
};
use crate::domain::ports::llm::{Planner, PlannerContext};
use crate::domain::ports::tool::ToolAdapter;

/// Error substrings (case-insensitive) that mark a failure as
/// replan-worthy rather than locally retryable.
pub const REPLAN_TRIGGERS: &[&str] = &[
    "tool not found",
    "tool unavailable",
    "missing required parameter",
    "authentication failed",
    "permission denied",
    "quota exceeded",
    "service unavailable",
    "timeout",
    "rate limit",
    "not found",
    "neither a page nor a database",
    "invalid",
];

/// Sentinel strings a resolver can leave behind for unfillable inputs.
const INVALID_SENTINELS: &[&str] = &["NOT_FOUND", "MISSING", "INVALID", "ERROR", "NULL", "UNDEFINED"];

/// Configuration for the plan executor.
#[derive(Debug, Clone)]
pub struct PlanExecutorConfig {
    /// Upper bound on scheduling rounds per run.
    pub max_execution_rounds: usize,
}

impl Default for PlanExecutorConfig {
    fn default() -> Self {
        Self {
            max_execution_rounds: 10,
        }
    }
}

/// Progress events streamed during a run.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    RoundStarted {
        round: usize,
        ready_steps: Vec<String>,
    },
    StepStarted {
        step_id: String,
    },
    StepFinished {
        step_id: String,
        success: bool,
    },
    RunCompleted {
        plan_id: String,
        outcome: PlanOutcome,
    },
}

/// Outcome classification of one step invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepAnalysis {
    pub success: bool,
    pub should_replan: bool,
    pub error: Option<String>,
    /// Value written to `step.result` on success, for later argument
    /// resolution.
    pub stored: Option<Value>,
}

impl StepAnalysis {
    fn success_with(stored: Option<Value>) -> Self {
        Self {
            success: true,
            should_replan: false,
            error: None,
            stored,
        }
    }

    fn failure(error: Option<String>, should_replan: bool) -> Self {
        Self {
            success: false,
            should_replan,
            error,
            stored: None,
        }
    }
}

/// Whether an error message contains any replan trigger.
pub fn matches_replan_trigger(error: &str) -> bool {
    let lowered = error.to_lowercase();
    REPLAN_TRIGGERS.iter().any(|t| lowered.contains(t))
}

/// Classify a tool invocation result.
///
/// Wrapped envelopes carry their payload as JSON text in the first
/// content block; everything else classifies by tag, with unknown shapes
/// counting as success for forward compatibility.
pub fn analyze_step_result(result: &ActionResult) -> StepAnalysis {
    match result {
        ActionResult::Wrapped(envelope) => analyze_wrapped(envelope),
        ActionResult::Tagged(TaggedResult::Error { error, .. }) => {
            StepAnalysis::failure(Some(error.clone()), matches_replan_trigger(error))
        }
        ActionResult::Tagged(TaggedResult::ToolResult { content, .. }) => {
            if is_meaningful(content) {
                StepAnalysis::success_with(Some(content.clone()))
            } else {
                StepAnalysis::failure(None, true)
            }
        }
        ActionResult::Tagged(TaggedResult::FinalAnswer { content, .. }) => {
            StepAnalysis::success_with(Some(Value::String(content.clone())))
        }
        ActionResult::Tagged(TaggedResult::NeedsReplan { feedback, .. }) => {
            StepAnalysis::failure(Some(feedback.clone()), true)
        }
        ActionResult::Tagged(TaggedResult::ToolResults { content }) => {
            StepAnalysis::success_with(serde_json::to_value(content).ok())
        }
        ActionResult::Other(value) => StepAnalysis::success_with(Some(value.clone())),
    }
}

fn analyze_wrapped(envelope: &WrappedEnvelope) -> StepAnalysis {
    if envelope.result.is_error == Some(true) {
        let error = envelope.first_text().map(ToString::to_string);
        return StepAnalysis::failure(error, true);
    }

    let Some(text) = envelope.first_text() else {
        return StepAnalysis::failure(None, true);
    };
    let Ok(payload) = serde_json::from_str::<EnvelopePayload>(text) else {
        return StepAnalysis::failure(None, true);
    };

    match payload.successful {
        Some(false) => {
            let should_replan = payload
                .error
                .as_deref()
                .map(matches_replan_trigger)
                .unwrap_or(false);
            StepAnalysis::failure(payload.error, should_replan)
        }
        Some(true) => {
            // Success even when data is empty.
            let stored = serde_json::from_str::<Value>(text).ok();
            StepAnalysis::success_with(stored)
        }
        None => {
            let data_empty = match &payload.data {
                None | Some(Value::Null) => true,
                Some(Value::Object(map)) => map.is_empty(),
                Some(_) => false,
            };
            if data_empty {
                StepAnalysis::failure(None, true)
            } else {
                let stored = serde_json::from_str::<Value>(text).ok();
                StepAnalysis::success_with(stored)
            }
        }
    }
}

/// Non-null, non-empty content counts as a meaningful tool result.
fn is_meaningful(content: &Value) -> bool {
    match content {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    }
}

/// Scan resolved arguments for resolver sentinel strings; returns the
/// offending key paths.
fn sentinel_violations(args: &Value, path: &str, out: &mut Vec<String>) {
    match args {
        Value::String(s) => {
            let hit = INVALID_SENTINELS
                .iter()
                .any(|sentinel| s == sentinel || s.starts_with(&format!("{sentinel}:")));
            if hit {
                out.push(if path.is_empty() { s.clone() } else { path.to_string() });
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                sentinel_violations(v, &child, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                sentinel_violations(v, &format!("{path}[{i}]"), out);
            }
        }
        _ => {}
    }
}

/// Derive the primary-cause bucket from the first failure message.
fn primary_cause(first_error: Option<&str>) -> String {
    let Some(error) = first_error else {
        return "Unknown failure".to_string();
    };
    let lowered = error.to_lowercase();
    if lowered.contains("invalid") {
        "Invalid input provided".to_string()
    } else if lowered.contains("not found") {
        "Resource not found".to_string()
    } else if lowered.contains("permission") || lowered.contains("authentication") {
        "Permission or authentication error".to_string()
    } else if lowered.contains("unavailable") || lowered.contains("timeout") {
        "Service unavailable or timeout".to_string()
    } else {
        error.to_string()
    }
}

fn suggested_strategy(cause: &str) -> String {
    match cause {
        "Invalid input provided" => "repair_arguments".to_string(),
        "Resource not found" => "alternate_discovery".to_string(),
        "Permission or authentication error" => "reauthenticate".to_string(),
        "Service unavailable or timeout" => "retry_later".to_string(),
        _ => "revise_plan".to_string(),
    }
}

/// Round-based dependency scheduler over one plan.
pub struct PlanExecutor<P: Planner, T: ToolAdapter> {
    planner: std::sync::Arc<P>,
    tools: std::sync::Arc<T>,
    config: PlanExecutorConfig,
    events: Option<mpsc::Sender<ExecutorEvent>>,
}

impl<P: Planner, T: ToolAdapter> PlanExecutor<P, T> {
    pub fn new(planner: std::sync::Arc<P>, tools: std::sync::Arc<T>, config: PlanExecutorConfig) -> Self {
        Self {
            planner,
            tools,
            config,
            events: None,
        }
    }

    /// Stream progress events during runs.
    pub fn with_events(mut self, sender: mpsc::Sender<ExecutorEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    async fn emit(&self, event: ExecutorEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event).await;
        }
    }

    /// Execute the plan to a terminal outcome.
    pub async fn run(
        &self,
        plan: &mut ExecutionPlan,
        context: &PlannerContext,
    ) -> RuntimeResult<PlanExecutionResult> {
        let started = Instant::now();
        self.normalize(plan);

        if plan.status == PlanStatus::WaitingInput {
            if let Some(missing) = self.resume_if_waiting_input(plan, context).await? {
                // Still blocked on inputs; report without executing.
                return Ok(self.build_result(
                    plan,
                    &[],
                    started,
                    Some(format!("Waiting for input: {}", missing.join(", "))),
                ));
            }
        }
        if plan.status == PlanStatus::Pending {
            plan.status = PlanStatus::Executing;
        }

        let mut executed: Vec<StepExecutionResult> = Vec::new();
        let mut completed_by_id: HashMap<String, StepExecutionResult> = HashMap::new();

        let mut round = 0;
        while round < self.config.max_execution_rounds {
            let ready = plan.ready_steps();
            if ready.is_empty() {
                break;
            }
            round += 1;
            debug!(round, ready = ?ready, "executing round");
            self.emit(ExecutorEvent::RoundStarted {
                round,
                ready_steps: ready.clone(),
            })
            .await;

            for step_id in ready {
                let result = self.execute_step_safe(plan, &step_id, context).await?;
                if result.success {
                    completed_by_id.insert(step_id.clone(), result.clone());
                }
                executed.push(result);
            }
        }

        self.skip_unreachable(plan);
        plan.current_step_index = plan.first_pending_index();

        let result = self.build_result(plan, &executed, started, None);
        plan.status = match result.outcome {
            PlanOutcome::ExecutionComplete => PlanStatus::Completed,
            PlanOutcome::NeedsReplan | PlanOutcome::Deadlock => PlanStatus::Failed,
        };
        info!(
            plan_id = %plan.id,
            outcome = result.outcome.as_str(),
            executed = executed.len(),
            "plan run finished"
        );
        self.emit(ExecutorEvent::RunCompleted {
            plan_id: plan.id.clone(),
            outcome: result.outcome,
        })
        .await;
        Ok(result)
    }

    /// Demote half-finished steps left over from an interrupted run and
    /// reset the step cursor.
    fn normalize(&self, plan: &mut ExecutionPlan) {
        for step in &mut plan.steps {
            if step.status == StepStatus::Executing {
                step.status = if step.result.is_some() {
                    StepStatus::Failed
                } else {
                    StepStatus::Pending
                };
            }
        }
        plan.current_step_index = plan.first_pending_index();
    }

    /// Probe the next pending step's arguments; returns the missing list
    /// if the plan must keep waiting.
    async fn resume_if_waiting_input(
        &self,
        plan: &mut ExecutionPlan,
        context: &PlannerContext,
    ) -> RuntimeResult<Option<Vec<String>>> {
        let index = plan.first_pending_index();
        let Some(step) = plan.steps.get(index) else {
            plan.status = PlanStatus::Executing;
            return Ok(None);
        };
        let raw_args = step.arguments.clone().unwrap_or_else(|| json!({}));
        let resolved = self
            .planner
            .resolve_args(&raw_args, &plan.steps, context)
            .await?;
        if resolved.missing.is_empty() {
            plan.status = PlanStatus::Executing;
            Ok(None)
        } else {
            Ok(Some(resolved.missing))
        }
    }

    /// Resolve arguments, invoke the step's action, classify the outcome,
    /// and update the step in place. Never propagates step-level failures.
    async fn execute_step_safe(
        &self,
        plan: &mut ExecutionPlan,
        step_id: &str,
        context: &PlannerContext,
    ) -> RuntimeResult<StepExecutionResult> {
        let step_started = Instant::now();
        let executed_at = Utc::now();

        let step_snapshot = plan
            .step(step_id)
            .cloned()
            .unwrap_or_else(|| PlanStep::new(step_id, "unknown step"));

        // Argument resolution with sentinel post-check.
        let mut missing: Vec<String> = Vec::new();
        let resolved_args = match &step_snapshot.arguments {
            Some(raw) => {
                let resolved = self
                    .planner
                    .resolve_args(raw, &plan.steps, context)
                    .await?;
                missing.extend(resolved.missing.clone());
                sentinel_violations(&resolved.args, "", &mut missing);
                resolved.args
            }
            None => json!({}),
        };

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            let error = format!("Missing inputs: {}", missing.join(", "));
            if let Some(step) = plan.step_mut(step_id) {
                step.status = StepStatus::Failed;
            }
            self.emit(ExecutorEvent::StepFinished {
                step_id: step_id.to_string(),
                success: false,
            })
            .await;
            return Ok(StepExecutionResult {
                step_id: step_id.to_string(),
                step: plan.step(step_id).cloned().unwrap_or(step_snapshot),
                success: false,
                result: None,
                error: Some(error),
                executed_at,
                duration_ms: step_started.elapsed().as_millis() as u64,
            });
        }

        if let Some(step) = plan.step_mut(step_id) {
            step.status = StepStatus::Executing;
        }
        self.emit(ExecutorEvent::StepStarted {
            step_id: step_id.to_string(),
        })
        .await;

        // Tool `none` (or absent) never reaches the tool adapter.
        let action_result = if step_snapshot.has_tool() {
            let tool_name = step_snapshot.tool.clone().unwrap_or_default();
            self.tools
                .act(AgentAction::ToolCall {
                    tool_name,
                    input: resolved_args,
                })
                .await
        } else {
            Ok(ActionResult::final_answer(step_snapshot.description.clone()))
        };

        let (analysis, result_value) = match action_result {
            Ok(result) => {
                let analysis = analyze_step_result(&result);
                (analysis, Some(result))
            }
            Err(e) => {
                let message = e.to_string();
                let should_replan = matches_replan_trigger(&message);
                (StepAnalysis::failure(Some(message), should_replan), None)
            }
        };

        if let Some(step) = plan.step_mut(step_id) {
            if analysis.success {
                step.status = StepStatus::Completed;
                step.result = analysis.stored.clone();
            } else {
                step.status = StepStatus::Failed;
            }
        }

        self.emit(ExecutorEvent::StepFinished {
            step_id: step_id.to_string(),
            success: analysis.success,
        })
        .await;

        Ok(StepExecutionResult {
            step_id: step_id.to_string(),
            step: plan.step(step_id).cloned().unwrap_or(step_snapshot),
            success: analysis.success,
            result: result_value,
            error: analysis.error,
            executed_at,
            duration_ms: step_started.elapsed().as_millis() as u64,
        })
    }

    /// Mark pending steps whose dependency chains can never complete as
    /// skipped.
    fn skip_unreachable(&self, plan: &mut ExecutionPlan) {
        loop {
            let dead: HashSet<String> = plan
                .steps
                .iter()
                .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
                .map(|s| s.id.clone())
                .collect();
            let to_skip: Vec<String> = plan
                .steps
                .iter()
                .filter(|s| {
                    s.status == StepStatus::Pending
                        && s.dependencies.iter().any(|d| dead.contains(d))
                })
                .map(|s| s.id.clone())
                .collect();
            if to_skip.is_empty() {
                break;
            }
            for id in to_skip {
                if let Some(step) = plan.step_mut(&id) {
                    step.status = StepStatus::Skipped;
                }
            }
        }
    }

    /// Classify the run and assemble the result, populating the replan
    /// context only when replanning is needed.
    fn build_result(
        &self,
        plan: &ExecutionPlan,
        executed: &[StepExecutionResult],
        started: Instant,
        feedback_override: Option<String>,
    ) -> PlanExecutionResult {
        let successful_steps: Vec<String> = executed
            .iter()
            .filter(|r| r.success)
            .map(|r| r.step_id.clone())
            .collect();
        let failed_steps: Vec<String> = executed
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.step_id.clone())
            .collect();
        let skipped_steps: Vec<String> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .map(|s| s.id.clone())
            .collect();

        let signals = plan.metadata.signals.clone();
        let has_signals_problems = signals.as_ref().is_some_and(|s| s.has_problems());

        let all_completed = plan
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed);
        let all_processed = plan
            .steps
            .iter()
            .all(|s| !matches!(s.status, StepStatus::Pending | StepStatus::Executing));

        let outcome = if has_signals_problems || feedback_override.is_some() {
            PlanOutcome::NeedsReplan
        } else if failed_steps.is_empty() && all_completed {
            PlanOutcome::ExecutionComplete
        } else if !failed_steps.is_empty() || (all_processed && !skipped_steps.is_empty()) {
            PlanOutcome::NeedsReplan
        } else if all_processed && !all_completed {
            PlanOutcome::Deadlock
        } else {
            PlanOutcome::ExecutionComplete
        };

        let feedback = feedback_override.unwrap_or_else(|| match outcome {
            PlanOutcome::ExecutionComplete => format!(
                "All {} steps completed successfully.",
                plan.steps.len()
            ),
            PlanOutcome::NeedsReplan if has_signals_problems => {
                let s = signals.clone().unwrap_or_default();
                format!(
                    "Signals require replanning: needs={:?} no_discovery_path={:?} errors={:?} suggested_next_step={:?}",
                    s.needs, s.no_discovery_path, s.errors, s.suggested_next_step
                )
            }
            PlanOutcome::NeedsReplan => format!(
                "{} step(s) failed, {} skipped; replanning required.",
                failed_steps.len(),
                skipped_steps.len()
            ),
            PlanOutcome::Deadlock => format!(
                "No runnable steps remain but {} step(s) are incomplete.",
                plan.steps
                    .iter()
                    .filter(|s| s.status != StepStatus::Completed)
                    .count()
            ),
        });

        let replan_context = (outcome == PlanOutcome::NeedsReplan).then(|| {
            let preserved_steps: Vec<StepExecutionResult> =
                executed.iter().filter(|r| r.success).cloned().collect();

            let mut failure_patterns: Vec<String> = Vec::new();
            for result in executed.iter().filter(|r| !r.success) {
                if let Some(error) = &result.error {
                    let lowered = error.to_lowercase();
                    if !failure_patterns.contains(&lowered) {
                        failure_patterns.push(lowered);
                    }
                }
            }

            let first_error = executed
                .iter()
                .filter(|r| !r.success)
                .find_map(|r| r.error.as_deref());
            let cause = primary_cause(first_error);
            let strategy = suggested_strategy(&cause);

            let mut context_for_replan = HashMap::new();
            context_for_replan.insert("plan_id".to_string(), json!(plan.id));
            context_for_replan.insert(
                "remaining_steps".to_string(),
                json!(plan
                    .steps
                    .iter()
                    .filter(|s| s.status != StepStatus::Completed)
                    .map(|s| s.id.clone())
                    .collect::<Vec<_>>()),
            );
            if let Some(s) = &signals {
                context_for_replan.insert("signals".to_string(), json!(s));
            }

            ReplanContext {
                preserved_steps,
                failure_patterns,
                primary_cause: cause,
                suggested_strategy: strategy,
                context_for_replan,
            }
        });

        PlanExecutionResult {
            outcome,
            plan_id: plan.id.clone(),
            strategy: plan.strategy.clone(),
            total_steps: plan.steps.len(),
            executed_steps: executed.to_vec(),
            successful_steps,
            failed_steps,
            skipped_steps,
            has_signals_problems,
            signals,
            execution_time_ms: started.elapsed().as_millis() as u64,
            feedback,
            replan_context,
        }
    }
}
