//! The boundary a pipeline step calls through to reach a model: one request
//! type, one response type, one streaming chunk contract, implemented by a
//! concrete adapter crate (not part of this workspace).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chat::{
    ChatResponse, FinishReason, Message, StructuredOutputFormat, Tool, ToolCall, ToolChoice, Usage,
};
use crate::error::LLMError;
use crate::params::LLMParams;

/// Everything needed to make one call to a provider.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub tool_choice: ToolChoice,
    pub params: LLMParams,
    /// Set when the caller wants the provider's native structured-output
    /// support (spec.md §4.8's `JsonSchema` capability path); adapters that
    /// lack native support ignore this and the caller falls back to prompt
    /// injection instead.
    pub response_format: Option<StructuredOutputFormat>,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        LlmRequest {
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            params: LLMParams::new(),
            response_format: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_params(mut self, params: LLMParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_response_format(mut self, format: StructuredOutputFormat) -> Self {
        self.response_format = Some(format);
        self
    }
}

/// A completed (non-streaming) response from a provider.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
    /// Model that actually served the request; may differ from the
    /// requested model name (fallback/routing adapters).
    pub model: Option<String>,
    /// Computed by the adapter from its own pricing table; the core never
    /// computes cost itself.
    pub cost_usd: Option<f64>,
}

impl Default for FinishReason {
    fn default() -> Self {
        FinishReason::Stop
    }
}

impl LlmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

impl ChatResponse for LlmResponse {
    fn text(&self) -> Option<String> {
        if self.content.is_empty() {
            None
        } else {
            Some(self.content.clone())
        }
    }

    fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls.clone()
    }

    fn finish_reason(&self) -> FinishReason {
        self.finish_reason
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

/// One increment of a streamed response.
///
/// `tool_call_updates` keys by the tool call's position in the response (not
/// its id, which may arrive only on the first chunk for that call) because
/// providers stream a call's `arguments` across many chunks before its id
/// and name are confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default)]
    pub is_thinking: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_call_updates: HashMap<usize, ToolCallDelta>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<Usage>,
}

/// Incremental update to one in-flight tool call within a stream.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCallDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Appended to the call's accumulated `arguments` buffer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arguments_delta: String,
}

/// A stream of chunks a streaming call yields, terminated by a chunk with
/// `is_complete = true`.
pub type ChunkStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, LLMError>> + Send>>;

/// The boundary a model adapter implements. Adapters live outside this
/// workspace; the pipeline step only ever depends on this trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse, LLMError>;

    async fn invoke_streaming(&self, request: LlmRequest) -> Result<ChunkStream, LLMError>;

    /// Best-effort token estimate for `text` under this provider's tokenizer,
    /// used by the sliding-window message selector. Adapters without an
    /// exact tokenizer may approximate (e.g. chars / 4).
    fn estimate_token_count(&self, text: &str) -> u32;
}
