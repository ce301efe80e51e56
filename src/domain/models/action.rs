//! Tagged agent actions and tool results.
//!
//! Every shape that crosses the planner/tool seams is a discriminated
//! union with a `type` tag. Unknown tags are deliberately tolerated at
//! the deserialization layer (they fall through to [`ActionResult::Other`])
//! so newer adapters keep working against this executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One tool invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
        }
    }
}

/// A tool call gated on the outputs of earlier calls in the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentToolCall {
    #[serde(flatten)]
    pub call: ToolCall,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Command produced by a planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    FinalAnswer {
        content: String,
    },
    NeedMoreInfo {
        question: String,
    },
    ToolCall {
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ExecutePlan {
        plan_id: String,
    },
    ParallelTools {
        calls: Vec<ToolCall>,
    },
    SequentialTools {
        calls: Vec<ToolCall>,
    },
    ConditionalTools {
        condition: String,
        when_true: Vec<ToolCall>,
        #[serde(default)]
        when_false: Vec<ToolCall>,
    },
    MixedTools {
        parallel: Vec<ToolCall>,
        sequential: Vec<ToolCall>,
    },
    DependencyTools {
        calls: Vec<DependentToolCall>,
    },
    DelegateToAgent {
        agent: String,
        input: Value,
    },
}

/// One planning turn: the reasoning trace plus the chosen action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThought {
    pub reasoning: String,
    pub action: AgentAction,
}

/// Per-tool entry inside a `tool_results` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tagged results returned by the tool adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaggedResult {
    ToolResult {
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, Value>>,
    },
    ToolResults {
        content: Vec<ToolResultEntry>,
    },
    FinalAnswer {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan_execution_result: Option<Value>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replan_context: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan_execution_result: Option<Value>,
    },
    NeedsReplan {
        feedback: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replan_context: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, Value>>,
    },
}

/// One content block inside a wrapped tool envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

/// Inner body of a wrapped tool envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeResult {
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default)]
    pub content: Vec<EnvelopeContent>,
}

/// Wrapped tool envelope: `{ result: { isError?, content: [...] } }`.
///
/// Some tool transports nest their outcome one level down with the actual
/// payload serialized as JSON text inside the first content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedEnvelope {
    pub result: EnvelopeResult,
}

impl WrappedEnvelope {
    /// The JSON text of the first `text` content block, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.result
            .content
            .iter()
            .find(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
    }
}

/// Payload conventionally found inside a wrapped envelope's text block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopePayload {
    #[serde(default)]
    pub successful: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Anything a tool adapter may hand back.
///
/// Untagged: a tagged result is tried first, then the wrapped envelope,
/// and any other JSON value is preserved as [`ActionResult::Other`]
/// (classified as success for forward compatibility).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionResult {
    Tagged(TaggedResult),
    Wrapped(WrappedEnvelope),
    Other(Value),
}

impl ActionResult {
    pub fn tool_result(content: Value) -> Self {
        Self::Tagged(TaggedResult::ToolResult {
            content,
            metadata: None,
        })
    }

    pub fn final_answer(content: impl Into<String>) -> Self {
        Self::Tagged(TaggedResult::FinalAnswer {
            content: content.into(),
            plan_execution_result: None,
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Tagged(TaggedResult::Error {
            error: error.into(),
            replan_context: None,
            feedback: None,
            plan_execution_result: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_tag_round_trip() {
        let action = AgentAction::ToolCall {
            tool_name: "search".into(),
            input: json!({"q": "rust"}),
        };
        let raw = serde_json::to_value(&action).unwrap();
        assert_eq!(raw["type"], "tool_call");
        let back: AgentAction = serde_json::from_value(raw).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_all_action_tags_deserialize() {
        let samples = [
            json!({"type": "final_answer", "content": "done"}),
            json!({"type": "need_more_info", "question": "which repo?"}),
            json!({"type": "tool_call", "tool_name": "search", "input": {}}),
            json!({"type": "execute_plan", "plan_id": "p1"}),
            json!({"type": "parallel_tools", "calls": []}),
            json!({"type": "sequential_tools", "calls": []}),
            json!({"type": "conditional_tools", "condition": "found", "when_true": [], "when_false": []}),
            json!({"type": "mixed_tools", "parallel": [], "sequential": []}),
            json!({"type": "dependency_tools", "calls": []}),
            json!({"type": "delegate_to_agent", "agent": "researcher", "input": {}}),
        ];
        for sample in samples {
            serde_json::from_value::<AgentAction>(sample.clone())
                .unwrap_or_else(|e| panic!("failed on {sample}: {e}"));
        }
    }

    #[test]
    fn test_result_untagged_precedence() {
        let tagged: ActionResult =
            serde_json::from_value(json!({"type": "tool_result", "content": "x"})).unwrap();
        assert!(matches!(
            tagged,
            ActionResult::Tagged(TaggedResult::ToolResult { .. })
        ));

        let wrapped: ActionResult = serde_json::from_value(json!({
            "result": {"isError": false, "content": [{"type": "text", "text": "{}"}]}
        }))
        .unwrap();
        assert!(matches!(wrapped, ActionResult::Wrapped(_)));

        let other: ActionResult =
            serde_json::from_value(json!({"type": "hologram", "content": 1})).unwrap();
        assert!(matches!(other, ActionResult::Other(_)));
    }

    #[test]
    fn test_wrapped_envelope_first_text() {
        let envelope: WrappedEnvelope = serde_json::from_value(json!({
            "result": {
                "isError": false,
                "content": [
                    {"type": "image", "text": ""},
                    {"type": "text", "text": "{\"successful\":true}"}
                ]
            }
        }))
        .unwrap();
        assert_eq!(envelope.first_text(), Some("{\"successful\":true}"));

        let payload: EnvelopePayload =
            serde_json::from_str(envelope.first_text().unwrap()).unwrap();
        assert_eq!(payload.successful, Some(true));
    }

    #[test]
    fn test_constructors() {
        assert!(matches!(
            ActionResult::tool_result(json!("x")),
            ActionResult::Tagged(TaggedResult::ToolResult { .. })
        ));
        assert!(matches!(
            ActionResult::final_answer("ok"),
            ActionResult::Tagged(TaggedResult::FinalAnswer { .. })
        ));
        assert!(matches!(
            ActionResult::error("boom"),
            ActionResult::Tagged(TaggedResult::Error { .. })
        ));
    }
}
