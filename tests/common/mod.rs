//! Common test utilities for integration tests
//!
//! Scripted planner and tool adapters shared across the integration test
//! files.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use arbiter::domain::errors::{RuntimeError, RuntimeResult};
use arbiter::domain::models::action::{ActionResult, AgentAction, AgentThought};
use arbiter::domain::models::plan::PlanStep;
use arbiter::domain::ports::llm::{Planner, PlannerContext, ResolvedArgs};
use arbiter::domain::ports::tool::ToolAdapter;

/// Planner stub that passes arguments through unchanged.
///
/// Matches the shape resolvers report in the missing-input scenarios: the
/// raw args come back as-is with an empty missing list, leaving sentinel
/// detection to the executor's post-check.
pub struct PassthroughPlanner;

#[async_trait]
impl Planner for PassthroughPlanner {
    async fn think(&self, input: &str, _context: &PlannerContext) -> RuntimeResult<AgentThought> {
        Ok(AgentThought {
            reasoning: format!("echo: {input}"),
            action: AgentAction::FinalAnswer {
                content: input.to_string(),
            },
        })
    }

    async fn resolve_args(
        &self,
        raw_args: &Value,
        _steps: &[PlanStep],
        _context: &PlannerContext,
    ) -> RuntimeResult<ResolvedArgs> {
        Ok(ResolvedArgs {
            args: raw_args.clone(),
            missing: Vec::new(),
        })
    }

    async fn create_final_response(&self, context: &PlannerContext) -> RuntimeResult<String> {
        Ok(format!("goal '{}' finished", context.goal))
    }
}

/// Tool adapter replaying scripted responses per tool name and recording
/// every call it receives.
pub struct ScriptedToolAdapter {
    responses: Mutex<HashMap<String, VecDeque<ActionResult>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedToolAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue a response for the next invocation of `tool`.
    pub async fn script(&self, tool: &str, response: ActionResult) {
        let mut responses = self.responses.lock().await;
        responses.entry(tool.to_string()).or_default().push_back(response);
    }

    /// Every `(tool_name, input)` pair seen so far.
    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ToolAdapter for ScriptedToolAdapter {
    async fn act(&self, action: AgentAction) -> RuntimeResult<ActionResult> {
        match action {
            AgentAction::ToolCall { tool_name, input } => {
                self.calls.lock().await.push((tool_name.clone(), input));
                let mut responses = self.responses.lock().await;
                responses
                    .get_mut(&tool_name)
                    .and_then(VecDeque::pop_front)
                    .ok_or_else(|| {
                        RuntimeError::ValidationFailed(format!(
                            "no scripted response for tool '{tool_name}'"
                        ))
                    })
            }
            other => Err(RuntimeError::ValidationFailed(format!(
                "scripted adapter only handles tool_call, got {other:?}"
            ))),
        }
    }
}

/// Build a wrapped tool envelope whose payload is the given JSON text.
pub fn wrapped_envelope(is_error: bool, text: &str) -> ActionResult {
    serde_json::from_value(serde_json::json!({
        "result": {
            "isError": is_error,
            "content": [{"type": "text", "text": text}]
        }
    }))
    .expect("envelope shape is valid")
}
