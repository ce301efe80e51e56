//! Agent runtime: drives the plan-act-observe loop over one kernel.
//!
//! Glues the planner and plan executor to the event bus: a submitted goal
//! becomes a plan, the executor runs it, step lifecycle events flow
//! through the kernel, and replan outcomes loop back into the planner
//! until the caller's replan budget is spent.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::plan::{PlanExecutionResult, PlanOutcome};
use crate::domain::ports::llm::{Planner, PlannerContext};
use crate::domain::ports::tool::ToolAdapter;
use crate::services::kernel::{EmitOptions, Kernel};
use crate::services::plan_executor::{PlanExecutor, PlanExecutorConfig};
use crate::services::planner::PlanAndExecutePlanner;

/// Outcome of one goal run.
#[derive(Debug)]
pub struct GoalRunResult {
    /// Final user-facing response from the planner.
    pub response: String,
    /// Result of the last executor run.
    pub last_run: PlanExecutionResult,
    /// How many replans were consumed.
    pub replans_used: u32,
}

/// Drives goals through plan, execute, and replan cycles on a kernel.
pub struct AgentRuntime<T: ToolAdapter> {
    kernel: Arc<Kernel>,
    planner: Arc<PlanAndExecutePlanner>,
    executor: PlanExecutor<PlanAndExecutePlanner, T>,
}

impl<T: ToolAdapter> AgentRuntime<T> {
    pub fn new(
        kernel: Arc<Kernel>,
        planner: Arc<PlanAndExecutePlanner>,
        tools: Arc<T>,
        executor_config: PlanExecutorConfig,
    ) -> Self {
        let executor = PlanExecutor::new(Arc::clone(&planner), tools, executor_config);
        Self {
            kernel,
            planner,
            executor,
        }
    }

    /// Plan and execute a goal, replanning on demand until the budget in
    /// `context.replan_budget` is spent. The runtime never invents a
    /// budget: with none set, a single plan is attempted.
    pub async fn run_goal(
        &self,
        goal: &str,
        mut context: PlannerContext,
    ) -> RuntimeResult<GoalRunResult> {
        context.goal = goal.to_string();
        let budget = context.replan_budget.unwrap_or(0);

        self.surface("agent.goal.submitted", json!({"goal": goal})).await;

        let mut replans_used = 0_u32;
        loop {
            let mut plan = self.planner.create_plan(goal, &context).await?;
            self.surface(
                "agent.plan.created",
                json!({"plan_id": plan.id, "steps": plan.steps.len(), "replans_used": replans_used}),
            )
            .await;

            let result = self.executor.run(&mut plan, &context).await?;
            self.surface(
                "agent.plan.finished",
                json!({
                    "plan_id": result.plan_id,
                    "outcome": result.outcome.as_str(),
                    "successful": result.successful_steps.len(),
                    "failed": result.failed_steps.len(),
                    "skipped": result.skipped_steps.len(),
                }),
            )
            .await;

            context.execution_history.extend(result.executed_steps.clone());

            match result.outcome {
                PlanOutcome::ExecutionComplete => {
                    let response = self.planner.create_final_response(&context).await?;
                    self.surface("agent.goal.completed", json!({"goal": goal})).await;
                    return Ok(GoalRunResult {
                        response,
                        last_run: result,
                        replans_used,
                    });
                }
                PlanOutcome::NeedsReplan if replans_used < budget => {
                    replans_used += 1;
                    info!(goal, replans_used, budget, "replanning");
                    context.replan_context = result.replan_context.clone();
                    context.replan_budget = Some(budget - replans_used);
                    self.surface(
                        "agent.goal.replanning",
                        json!({"goal": goal, "replans_used": replans_used}),
                    )
                    .await;
                }
                PlanOutcome::NeedsReplan => {
                    self.surface("agent.goal.exhausted", json!({"goal": goal})).await;
                    return Err(RuntimeError::Planner(format!(
                        "replan budget exhausted after {replans_used} replan(s): {}",
                        result.feedback
                    )));
                }
                PlanOutcome::Deadlock => {
                    self.surface("agent.goal.deadlocked", json!({"goal": goal})).await;
                    return Err(RuntimeError::Planner(format!(
                        "plan deadlocked: {}",
                        result.feedback
                    )));
                }
            }
        }
    }

    /// Best-effort lifecycle emission; a saturated bus never fails the
    /// goal itself.
    async fn surface(&self, event_type: &str, data: serde_json::Value) {
        if let Err(e) = self
            .kernel
            .emit(event_type, data, EmitOptions::default())
            .await
        {
            warn!(event_type, error = %e, "lifecycle emission dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::action::{
        ActionResult, AgentAction, AgentThought,
    };
    use crate::domain::ports::llm::{LlmAdapter, PlanningTechnique, ProviderInfo, ToolSpec};
    use crate::infrastructure::storage::memory::InMemoryPersistor;
    use crate::services::kernel::KernelConfig;
    use crate::services::planner::PlannerConfig;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Adapter replaying a queue of plan JSON bodies.
    struct ReplayAdapter {
        plans: Mutex<VecDeque<Value>>,
    }

    #[async_trait]
    impl LlmAdapter for ReplayAdapter {
        fn get_provider(&self) -> ProviderInfo {
            ProviderInfo {
                name: "replay".to_string(),
            }
        }

        fn get_available_techniques(&self) -> Vec<PlanningTechnique> {
            vec![PlanningTechnique::React]
        }

        async fn generate_thought(&self, _prompt: &str) -> RuntimeResult<AgentThought> {
            let next = self
                .plans
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| json!({"steps": []}));
            Ok(AgentThought {
                reasoning: "replayed".to_string(),
                action: AgentAction::FinalAnswer {
                    content: next.to_string(),
                },
            })
        }
    }

    /// Tool adapter where `good` succeeds and `bad` always errors.
    struct SplitTools;

    #[async_trait]
    impl ToolAdapter for SplitTools {
        async fn act(&self, action: AgentAction) -> RuntimeResult<ActionResult> {
            match action {
                AgentAction::ToolCall { tool_name, .. } if tool_name == "good" => {
                    Ok(ActionResult::tool_result(json!({"ok": true})))
                }
                AgentAction::ToolCall { .. } => {
                    Ok(ActionResult::error("service unavailable"))
                }
                other => Err(RuntimeError::ValidationFailed(format!(
                    "unexpected action {other:?}"
                ))),
            }
        }
    }

    async fn runtime_with(plans: Vec<Value>) -> (AgentRuntime<SplitTools>, Arc<Kernel>) {
        let kernel = Kernel::new(KernelConfig::default(), Arc::new(InMemoryPersistor::new()));
        kernel.initialize().await.unwrap();

        let adapter = Arc::new(ReplayAdapter {
            plans: Mutex::new(plans.into_iter().collect()),
        });
        let planner =
            Arc::new(PlanAndExecutePlanner::new(adapter, PlannerConfig::default()).unwrap());
        let runtime = AgentRuntime::new(
            Arc::clone(&kernel),
            planner,
            Arc::new(SplitTools),
            PlanExecutorConfig::default(),
        );
        (runtime, kernel)
    }

    fn tool_context(budget: Option<u32>) -> PlannerContext {
        PlannerContext {
            available_tools: vec![ToolSpec::new("good", "works"), ToolSpec::new("bad", "breaks")],
            replan_budget: budget,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_goal_completes_first_pass() {
        let (runtime, kernel) = runtime_with(vec![
            json!({"steps": [{"id": "s1", "description": "do it", "tool": "good"}]}),
            // Second thought answers the final-response prompt.
            json!({"steps": []}),
        ])
        .await;

        let result = runtime.run_goal("ship it", tool_context(None)).await.unwrap();
        assert_eq!(result.replans_used, 0);
        assert_eq!(result.last_run.outcome, PlanOutcome::ExecutionComplete);
        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn test_goal_replans_within_budget() {
        let (runtime, kernel) = runtime_with(vec![
            json!({"steps": [{"id": "s1", "description": "first try", "tool": "bad"}]}),
            json!({"steps": [{"id": "s1-retry", "description": "second try", "tool": "good"}]}),
            json!({"steps": []}),
        ])
        .await;

        let result = runtime
            .run_goal("ship it", tool_context(Some(1)))
            .await
            .unwrap();
        assert_eq!(result.replans_used, 1);
        assert_eq!(result.last_run.outcome, PlanOutcome::ExecutionComplete);
        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn test_goal_fails_when_budget_spent() {
        let (runtime, kernel) = runtime_with(vec![json!({
            "steps": [{"id": "s1", "description": "hopeless", "tool": "bad"}]
        })])
        .await;

        let err = runtime
            .run_goal("ship it", tool_context(None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PLANNER_ERROR");
        assert!(err.to_string().contains("replan budget exhausted"));
        kernel.shutdown().await;
    }
}
