//! The tool protocol (spec §4.12), grounded on the corpus's
//! `execute_tool_call`/`record_tool_side_effects` pattern in the agent's tool
//! execution path: dispatch by name, synthesize an error string rather than
//! propagate on unknown-tool or tool-exception, and let the tool own its own
//! argument-validation robustness.

use crate::context::PipelineContext;
use crate::events::EventKind;
use async_trait::async_trait;
use llm_core::Tool as ToolDefinition;
use schemars::Schema;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

/// A named callable capability the LLM step may invoke. Tools validate their
/// own arguments; garbled LLM-provided JSON (case-variant keys, missing
/// quotes, path aliases) is the tool's concern, not the core's.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Prose folded into the LLM step's system prompt describing how/when
    /// to invoke this tool; `None` omits it.
    fn usage_guidelines(&self) -> Option<&str> {
        None
    }

    fn parameters_schema(&self) -> Schema;

    async fn execute(
        &self,
        arguments_json: &str,
        ctx: &PipelineContext,
        step_name: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

/// Immutable after host construction (spec §5, "Tool registry is immutable
/// after host construction").
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| {
                let schema = serde_json::to_value(tool.parameters_schema())
                    .unwrap_or(serde_json::Value::Null);
                ToolDefinition::function(tool.name(), tool.description(), schema)
            })
            .collect()
    }

    /// System-prompt fragment gathering every registered tool's usage
    /// guidelines (spec §4.8).
    pub fn usage_guidelines_prompt(&self) -> Option<String> {
        let mut entries: Vec<&Arc<dyn Tool>> = self.tools.values().collect();
        entries.sort_by_key(|tool| tool.name().to_string());
        let lines: Vec<String> = entries
            .into_iter()
            .filter_map(|tool| tool.usage_guidelines().map(|g| format!("- {}: {}", tool.name(), g)))
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(format!("Tool usage guidelines:\n{}", lines.join("\n")))
        }
    }

    /// Runs one named call. Unknown names and exceptions are both converted
    /// into a result string rather than propagated — callers always get a
    /// string back (spec §4.12).
    pub async fn run(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        arguments_json: &str,
        ctx: &PipelineContext,
        step_name: &str,
        cancel: &CancellationToken,
    ) -> String {
        let span = info_span!("pipeline.tool", tool_call_id, tool_name, step_name);
        async {
            ctx.emit(
                Some(step_name),
                EventKind::ToolStarted {
                    tool_call_id: tool_call_id.to_string(),
                    tool_name: tool_name.to_string(),
                    arguments: arguments_json.to_string(),
                },
            );

            let (success, result) = match self.tools.get(tool_name) {
                None => (false, format!("Error: Tool '{tool_name}' not found")),
                Some(tool) => match tool.execute(arguments_json, ctx, step_name, cancel).await {
                    Ok(output) => (true, output),
                    Err(err) => (false, format!("Error executing tool: {err}")),
                },
            };

            ctx.emit(
                Some(step_name),
                EventKind::ToolCompleted {
                    tool_call_id: tool_call_id.to_string(),
                    tool_name: tool_name.to_string(),
                    success,
                    result: result.clone(),
                },
            );

            result
        }
        .instrument(span)
        .await
    }
}
