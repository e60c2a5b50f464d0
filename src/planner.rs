//! Planner: decides between tool calls and a final answer
//!
//! The planner model sees the conversation, the tool catalog, and all
//! accumulated tool results, and answers with a JSON decision. Unparseable
//! decisions fail open to a direct response so a malformed model turn
//! never wedges the state machine.

use crate::error::Result;
use crate::extraction::prompts::PLANNER_SYSTEM_PROMPT;
use crate::extraction::vlm::parse_json_object;
use crate::llm::{system_message, LlmClient, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A tool invocation the planner requested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedToolCall {
    pub call_id: String,
    pub tool: String,
    pub params: Value,
}

/// The planner's decision for one step
#[derive(Debug, Clone)]
pub enum PlannerDecision {
    /// Dispatch these tools, then re-plan
    ToolCalls {
        thought: String,
        calls: Vec<PlannedToolCall>,
    },
    /// Emit the final answer
    Respond { thought: String, answer: String },
}

/// Planner over the configured model
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// One planning step over the conversation so far
    pub async fn plan(
        &self,
        history: &[Message],
        tool_catalog: &str,
        round: usize,
    ) -> Result<PlannerDecision> {
        let system = format!(
            "{}\n\nAvailable tools:\n{}",
            PLANNER_SYSTEM_PROMPT, tool_catalog
        );

        let mut messages = vec![system_message(system)];
        messages.extend_from_slice(history);

        let response = self.llm.generate(&self.model, &messages).await?;
        Ok(parse_decision(&response.text, round))
    }
}

/// Parse the model's JSON decision; anything unparseable becomes a direct
/// response carrying the raw text
pub fn parse_decision(text: &str, round: usize) -> PlannerDecision {
    let Some(value) = parse_json_object(text) else {
        debug!("planner output not JSON, treating as direct response");
        return PlannerDecision::Respond {
            thought: String::new(),
            answer: text.trim().to_string(),
        };
    };

    let thought = value
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match value.get("action").and_then(Value::as_str) {
        Some("tool_calls") => {
            let calls: Vec<PlannedToolCall> = value
                .get("calls")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .enumerate()
                        .filter_map(|(index, item)| {
                            let tool = item.get("tool").and_then(Value::as_str)?;
                            Some(PlannedToolCall {
                                call_id: format!("call-{}-{}", round, index),
                                tool: tool.to_string(),
                                params: item.get("params").cloned().unwrap_or(Value::Null),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            if calls.is_empty() {
                // A tool_calls action with no calls degenerates to a
                // response so the loop cannot spin.
                PlannerDecision::Respond {
                    thought,
                    answer: "I could not determine which tool to use for this question."
                        .to_string(),
                }
            } else {
                PlannerDecision::ToolCalls { thought, calls }
            }
        }
        _ => {
            let answer = value
                .get("answer")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| text.trim().to_string());
            PlannerDecision::Respond { thought, answer }
        }
    }
}
