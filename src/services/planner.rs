//! LLM-backed plan-and-execute planner.
//!
//! The planner turns a goal plus execution context into either a direct
//! action or a dependency-ordered plan, resolves step arguments against
//! prior outputs, and composes the final response. Provider specifics
//! live behind the [`LlmAdapter`] port; the planner only builds prompts
//! and validates shapes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::action::{AgentAction, AgentThought};
use crate::domain::models::plan::{ExecutionPlan, PlanSignals, PlanStep, StepStatus};
use crate::domain::ports::llm::{
    LlmAdapter, Planner, PlannerContext, PlanningTechnique, ResolvedArgs,
};

/// Reference prefix that binds an argument to a prior step's output,
/// e.g. `$steps.fetch-user.data.id`.
const STEP_REF_PREFIX: &str = "$steps.";

/// Extract a JSON object from LLM text output.
///
/// Handles markdown code blocks (```json...```) and JSON embedded in
/// prose text.
pub fn extract_json_from_response(response: &str) -> String {
    let trimmed = response.trim();

    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
    }
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed.to_string();
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return trimmed[start..=end].to_string();
        }
    }
    trimmed.to_string()
}

/// Configuration for the plan-and-execute planner.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Reasoning technique; must be offered by the adapter.
    pub technique: PlanningTechnique,
    /// Strategy label stamped onto produced plans.
    pub strategy: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            technique: PlanningTechnique::React,
            strategy: "plan_and_execute".to_string(),
        }
    }
}

/// Raw plan shape as the LLM emits it.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    signals: Option<PlanSignals>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    id: String,
    description: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// LLM-backed planner for the plan-and-execute strategy.
pub struct PlanAndExecutePlanner {
    adapter: std::sync::Arc<dyn LlmAdapter>,
    config: PlannerConfig,
}

impl PlanAndExecutePlanner {
    /// Build a planner, checking the technique against the adapter's
    /// declared capabilities.
    pub fn new(
        adapter: std::sync::Arc<dyn LlmAdapter>,
        config: PlannerConfig,
    ) -> RuntimeResult<Self> {
        let offered = adapter.get_available_techniques();
        if !offered.contains(&config.technique) {
            return Err(RuntimeError::Planner(format!(
                "provider '{}' does not offer technique '{}' (offers: {})",
                adapter.get_provider().name,
                config.technique,
                offered
                    .iter()
                    .map(PlanningTechnique::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(Self { adapter, config })
    }

    /// Ask the LLM for a full execution plan and validate it.
    pub async fn create_plan(
        &self,
        goal: &str,
        context: &PlannerContext,
    ) -> RuntimeResult<ExecutionPlan> {
        let prompt = self.build_plan_prompt(goal, context);
        let thought = self.adapter.generate_thought(&prompt).await?;

        let raw_text = match thought.action {
            AgentAction::FinalAnswer { content } => content,
            // A planner that answers with anything else did not produce a
            // plan; surface its reasoning for diagnosis.
            other => {
                return Err(RuntimeError::Planner(format!(
                    "expected a plan, got action {other:?} ({})",
                    thought.reasoning
                )))
            }
        };

        self.parse_plan(&raw_text, context)
    }

    /// Parse and validate a plan from LLM text output.
    pub fn parse_plan(&self, text: &str, context: &PlannerContext) -> RuntimeResult<ExecutionPlan> {
        let raw: RawPlan = serde_json::from_str(&extract_json_from_response(text))
            .map_err(|e| RuntimeError::Planner(format!("plan did not parse as JSON: {e}")))?;

        let steps: Vec<PlanStep> = raw
            .steps
            .into_iter()
            .map(|s| PlanStep {
                id: s.id,
                description: s.description,
                tool: s.tool,
                arguments: s.arguments,
                dependencies: s.dependencies,
                status: StepStatus::Pending,
                result: None,
            })
            .collect();

        let mut plan = ExecutionPlan::new(
            raw.id.unwrap_or_else(|| format!("plan-{}", uuid::Uuid::new_v4())),
            self.config.strategy.clone(),
            steps,
        );
        if let Some(signals) = raw.signals {
            plan.metadata.signals = Some(signals);
        }

        let registered: HashSet<String> = context
            .available_tools
            .iter()
            .map(|t| t.name.clone())
            .collect();
        plan.validate(&registered)?;
        Ok(plan)
    }

    fn build_plan_prompt(&self, goal: &str, context: &PlannerContext) -> String {
        let tools_text = if context.available_tools.is_empty() {
            "None registered".to_string()
        } else {
            context
                .available_tools
                .iter()
                .map(|t| format!("- {}: {}", t.name, t.description))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let history_text = if context.execution_history.is_empty() {
            "No prior execution".to_string()
        } else {
            context
                .execution_history
                .iter()
                .map(|r| {
                    format!(
                        "- {} [{}]{}",
                        r.step_id,
                        if r.success { "ok" } else { "failed" },
                        r.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let replan_text = match &context.replan_context {
            None => "First planning pass".to_string(),
            Some(rc) => format!(
                "Primary cause: {}\nFailure patterns: {}\nPreserved steps: {}\nRemaining replan budget: {}",
                rc.primary_cause,
                rc.failure_patterns.join("; "),
                rc.preserved_steps
                    .iter()
                    .map(|s| s.step_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                context
                    .replan_budget
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "unspecified".to_string()),
            ),
        };

        format!(
            r#"You are a {technique} planning assistant for an agent runtime.

## Goal
{goal}

## Available Tools
{tools}

## Execution History
{history}

## Replan Context
{replan}

## Instructions
Produce a dependency-ordered execution plan. Each step needs a unique
kebab-case id, a description, a tool from the list above (or "none" for a
description-only step), optional arguments, and the ids of earlier steps
it depends on. Reference a prior step's output in arguments with
"$steps.<step-id>.<path>". If inputs are missing or no discovery path
exists, say so in "signals".

## Required Output Format (JSON)
```json
{{
  "id": "plan-short-slug",
  "steps": [
    {{
      "id": "kebab-case-id",
      "description": "what this step does",
      "tool": "tool-name-or-none",
      "arguments": {{}},
      "dependencies": []
    }}
  ],
  "signals": {{"needs": [], "no_discovery_path": [], "errors": [], "suggested_next_step": null}}
}}
```

IMPORTANT: Output ONLY the JSON object, no other text."#,
            technique = self.config.technique,
            goal = goal,
            tools = tools_text,
            history = history_text,
            replan = replan_text,
        )
    }

    /// Resolve one argument value, tracking the missing list.
    fn resolve_value(
        value: &Value,
        key_path: &str,
        steps: &[PlanStep],
        missing: &mut Vec<String>,
    ) -> Value {
        match value {
            Value::String(s) if s.starts_with(STEP_REF_PREFIX) => {
                let reference = &s[STEP_REF_PREFIX.len()..];
                let mut parts = reference.split('.');
                let step_id = parts.next().unwrap_or_default();
                let step = steps
                    .iter()
                    .find(|st| st.id == step_id && st.status == StepStatus::Completed);
                let Some(step) = step else {
                    missing.push(key_path.to_string());
                    return value.clone();
                };
                let Some(result) = step.result.as_ref() else {
                    missing.push(key_path.to_string());
                    return value.clone();
                };
                let mut current = result;
                for part in parts {
                    match current.get(part) {
                        Some(next) => current = next,
                        None => {
                            missing.push(key_path.to_string());
                            return value.clone();
                        }
                    }
                }
                current.clone()
            }
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    let child_path = if key_path.is_empty() {
                        k.clone()
                    } else {
                        format!("{key_path}.{k}")
                    };
                    out.insert(k.clone(), Self::resolve_value(v, &child_path, steps, missing));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        Self::resolve_value(v, &format!("{key_path}[{i}]"), steps, missing)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[async_trait]
impl Planner for PlanAndExecutePlanner {
    async fn think(&self, input: &str, context: &PlannerContext) -> RuntimeResult<AgentThought> {
        let prompt = format!(
            "{}\n\n## Current Input\n{input}\n\nRespond with a JSON object {{\"reasoning\": ..., \"action\": {{\"type\": ...}}}}.",
            self.build_plan_prompt(&context.goal, context)
        );
        self.adapter.generate_thought(&prompt).await
    }

    async fn resolve_args(
        &self,
        raw_args: &Value,
        steps: &[PlanStep],
        _context: &PlannerContext,
    ) -> RuntimeResult<ResolvedArgs> {
        let mut missing = Vec::new();
        let args = Self::resolve_value(raw_args, "", steps, &mut missing);
        Ok(ResolvedArgs { args, missing })
    }

    async fn create_final_response(&self, context: &PlannerContext) -> RuntimeResult<String> {
        let summary = context
            .execution_history
            .iter()
            .map(|r| {
                format!(
                    "- {} [{}]{}",
                    r.step_id,
                    if r.success { "ok" } else { "failed" },
                    r.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize the outcome of this run for the user.\n\n## Goal\n{}\n\n## Step Results\n{}\n\nRespond with a JSON object {{\"reasoning\": ..., \"action\": {{\"type\": \"final_answer\", \"content\": ...}}}}.",
            context.goal, summary
        );
        let thought = self.adapter.generate_thought(&prompt).await?;
        match thought.action {
            AgentAction::FinalAnswer { content } => Ok(content),
            _ => Ok(thought.reasoning),
        }
    }
}

/// Direct Messages-API adapter.
///
/// Owns the HTTP client and response shaping; the planner never sees the
/// wire format.
pub struct DirectApiAdapter {
    http_client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl DirectApiAdapter {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http_client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
        }
    }
}

#[async_trait]
impl LlmAdapter for DirectApiAdapter {
    fn get_provider(&self) -> crate::domain::ports::llm::ProviderInfo {
        crate::domain::ports::llm::ProviderInfo {
            name: "anthropic".to_string(),
        }
    }

    fn get_available_techniques(&self) -> Vec<PlanningTechnique> {
        vec![
            PlanningTechnique::Cot,
            PlanningTechnique::React,
            PlanningTechnique::Ooda,
        ]
    }

    async fn generate_thought(&self, prompt: &str) -> RuntimeResult<AgentThought> {
        let request_body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .http_client
            .post(&self.api_url)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| RuntimeError::Planner(format!("provider request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Planner(format!(
                "provider error {status}: {body}"
            )));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| RuntimeError::Planner(format!("malformed provider response: {e}")))?;

        let text = result["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| {
                        (block["type"].as_str() == Some("text"))
                            .then(|| block["text"].as_str().map(String::from))
                            .flatten()
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(RuntimeError::Planner("provider returned no text".into()));
        }

        serde_json::from_str::<AgentThought>(&extract_json_from_response(&text))
            .map_err(|e| RuntimeError::Planner(format!("output did not shape into a thought: {e}")))
    }
}
