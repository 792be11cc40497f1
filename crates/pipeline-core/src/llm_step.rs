//! The LLM step and its correction loop (spec §4.7-§4.11). Grounded
//! conceptually on the corpus's tool-execution/retry-with-feedback pattern
//! (originally `agent/tool_execution.rs` and `agent/execution.rs`), rebuilt
//! around this crate's `StepResult`/`PipelineContext`/`ToolRegistry` rather
//! than the corpus's session-actor plumbing.
//!
//! The step's own cognitive retry loop is internal to `invoke` — distinct
//! from the executor's generic `RetryMiddleware`, which governs transport
//! and programming faults for ordinary steps. An `LlmStep` is typically
//! scheduled directly by name rather than wrapped in the middleware chain,
//! since its retry semantics (synthetic feedback messages, bookmark
//! restore) are specific to it.

use crate::context::PipelineContext;
use crate::conversation::normalize_to_single_exchange;
use crate::error::{ParseError, StepFault};
use crate::events::EventKind;
use crate::result::{StepRef, StepResult};
use crate::executor::{StepInvocation, run_step_chain};
use crate::step::{DynStep, step_result_into_attempt};
use crate::streaming_tag::StreamingTagParser;
use crate::tool::ToolRegistry;
use async_trait::async_trait;
use llm_core::{
    LLMParams, LlmProvider, LlmRequest, LlmResponse, StructuredOutputFormat, ToolCall, ToolChoice,
};
use schemars::Schema;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

/// Read-only tools tolerate a longer run of identical repeated calls before
/// the loop detector gives up on them (spec §4.9).
const READ_ONLY_TOOLS: &[&str] = &[
    "view_file",
    "grep_search",
    "list_dir",
    "find_by_name",
    "view_file_outline",
    "view_code_item",
];

/// How the step's declared output type constrains request construction and
/// response parsing (spec §4.8, §4.10). The step's `Output` is always
/// `serde_json::Value`; this governs how a response's text is turned into
/// one.
#[derive(Clone)]
pub enum OutputSpec {
    /// No schema attached; the raw response text is the value.
    Text,
    /// Best-effort conversion of the response text to a JSON number.
    Number,
    /// Best-effort conversion of the response text to a JSON boolean.
    Boolean,
    /// Deserialize the response text (after cleanup) against `schema`.
    Json(Schema),
}

impl OutputSpec {
    fn schema_for_prompt(&self) -> Option<Value> {
        match self {
            OutputSpec::Json(schema) => Some(serde_json::to_value(schema).unwrap_or(Value::Null)),
            _ => None,
        }
    }
}

/// How the provider profile supports structured output (spec §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonCapability {
    /// Attach the schema natively to the request.
    JsonSchema,
    /// Set response MIME to JSON, inject schema text into the system prompt.
    JsonObject,
    /// No native support; fold schema prose into the user message.
    None,
}

/// Builds the user message for one invocation from the step's input and the
/// ambient context.
pub type MessageBuilder = Arc<dyn Fn(&Value, &PipelineContext) -> String + Send + Sync>;

#[derive(Clone)]
pub struct LlmStepConfig {
    pub name: String,
    pub max_retries: u32,
    pub max_tool_iterations: usize,
    pub use_streaming: bool,
    pub json_capability: JsonCapability,
    pub output: OutputSpec,
    pub system_prompt: Option<String>,
    pub params: LLMParams,
    pub message_builder: MessageBuilder,
    /// Ceiling for the whole correction loop, enforced by the middleware
    /// chain's `TimeoutMiddleware`/`RetryMiddleware`, not by `run()` itself.
    pub timeout: Duration,
}

/// The LLM step (spec §4.7). Stateless and reusable across invocations; all
/// mutable state lives in the `PipelineContext`'s conversation for the
/// duration of one `invoke`. `Clone` is cheap (an `Arc` provider, a `Clone`
/// tool registry, `Arc` tag handlers) and lets `invoke` move an owned copy
/// into the middleware chain's attempt closure.
#[derive(Clone)]
pub struct LlmStep {
    pub config: LlmStepConfig,
    pub provider: Arc<dyn LlmProvider>,
    pub tools: ToolRegistry,
    pub tag_handlers: Vec<Arc<dyn crate::streaming_tag::StreamingTagHandler>>,
    step_config: crate::step::StepConfig,
}

impl LlmStep {
    pub fn new(
        config: LlmStepConfig,
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        tag_handlers: Vec<Arc<dyn crate::streaming_tag::StreamingTagHandler>>,
    ) -> Self {
        let step_config = crate::step::StepConfig {
            max_retries: 0,
            retry_delay_ms: 0,
            timeout: config.timeout,
        };
        LlmStep {
            config,
            provider,
            tools,
            tag_handlers,
            step_config,
        }
    }
}

#[async_trait]
impl DynStep for LlmStep {
    type Output = Value;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &crate::step::StepConfig {
        // `run()` owns its own cognitive retry loop (synthetic feedback,
        // bookmark restore), so the outer chain must not retry on top of it
        // — only observe and enforce the declared timeout.
        &self.step_config
    }

    async fn invoke(&self, ctx: &PipelineContext, cancel: &CancellationToken) -> StepResult<Value> {
        let this = self.clone();
        let owned_ctx = ctx.clone();
        let owned_cancel = cancel.clone();
        let invocation = StepInvocation {
            step_name: self.config.name.clone(),
            max_retries: 0,
            retry_delay_ms: 0,
            timeout: self.config.timeout,
            attempt_fn: Arc::new(move |_attempt, _last: Option<Value>| {
                let this = this.clone();
                let ctx = owned_ctx.clone();
                let cancel = owned_cancel.clone();
                Box::pin(async move {
                    let result = this.run(&Value::Null, &ctx, &cancel).await;
                    step_result_into_attempt(result, "llm step produced no result")
                })
            }),
            validate_fn: Arc::new(|_value: Value| Box::pin(async { Ok(()) })),
        };
        run_step_chain(invocation, ctx, cancel, &[]).await
    }
}

impl LlmStep {
    /// Runs the full correction loop for `input` and returns the final
    /// typed result. Separated from `DynStep::invoke` so a caller with a
    /// concrete typed input doesn't have to round-trip it through `Value`.
    pub async fn run(&self, input: &Value, ctx: &PipelineContext, cancel: &CancellationToken) -> StepResult<Value> {
        let step_name = self.config.name.as_str();
        let step_ref = StepRef::new(step_name, ctx.child_path(step_name));
        let span = info_span!("pipeline.llm_step", name = %step_name, correlation_id = %ctx.correlation_id);

        async {
            let initial_bookmark = ctx.conversation.write().history.create_bookmark();
            let initial_length = ctx.conversation.read().history.len();
            let user_message = (self.config.message_builder)(input, ctx);

            // Scoped to this step's name so a context shared or branched
            // across multiple `LlmStep`s (or reused across `run()` calls)
            // never inherits another invocation's call-set history.
            let loop_detector_key = format!("{LOOP_DETECTOR_KEY}:{step_name}");
            ctx.metadata_set(loop_detector_key.clone(), Value::Null);

            let mut outcome: Result<Value, String> = Err("unreachable".to_string());
            let mut last_assistant_text = String::new();

            for attempt in 1..=self.config.max_retries.max(1) {
                if attempt > 1 {
                    let feedback = match &outcome {
                        Err(message) => message.clone(),
                        Ok(_) => String::new(),
                    };
                    ctx.conversation.write().history.add_user_message(format!(
                        "Your previous response could not be used: {feedback}\nPlease try again."
                    ));
                } else {
                    ctx.conversation.write().history.add_user_message(user_message.clone());
                }

                let request = self.build_request(ctx);
                // Transient/provider/cancellation/tool-iteration faults are
                // terminal here; only structural validation and parse
                // failures drive this loop's own retries (spec §4.7, §7).
                let response = match self
                    .invoke_with_tools(request, ctx, 0, &loop_detector_key, cancel)
                    .await
                {
                    Ok(response) => response,
                    Err(fault) => {
                        outcome = Err(fault.to_string());
                        break;
                    }
                };

                last_assistant_text = response.content.clone();
                match parse_output(&self.config.output, &response.content) {
                    Ok(value) => {
                        outcome = Ok(value);
                        break;
                    }
                    Err(parse_err) => {
                        ctx.emit(
                            Some(step_name),
                            EventKind::StepValidation {
                                attempt,
                                passed: false,
                                diagnostic: Some(parse_err.to_string()),
                            },
                        );
                        outcome = Err(parse_err.to_string());
                    }
                }
            }

            // finalize: restore to the bookmark and append exactly one
            // clean user + one assistant message, regardless of how many
            // retries or tool round-trips occurred (spec §4.7, invariant 4).
            {
                let assistant_content = match &outcome {
                    Ok(_) => last_assistant_text.clone(),
                    Err(message) => format!("[error: {message}]"),
                };
                let mut conversation = ctx.conversation.write();
                let _ = normalize_to_single_exchange(
                    &mut conversation.history,
                    initial_bookmark,
                    user_message.clone(),
                    assistant_content,
                );
            }
            debug_assert_eq!(ctx.conversation.read().history.len(), initial_length + 2);

            match outcome {
                Ok(value) => StepResult::success(value, step_ref),
                Err(message) => StepResult::error(message, step_ref),
            }
        }
        .instrument(span)
        .await
    }

    fn build_request(&self, ctx: &PipelineContext) -> LlmRequest {
        let conversation = ctx.conversation.read();
        let mut messages = conversation.history.get_messages_for_request_with_counter(
            None,
            None,
            true,
            &|text| self.provider.estimate_token_count(text),
        );

        let mut system_prompt = self.config.system_prompt.clone().unwrap_or_default();
        if let Some(guidelines) = self.tools.usage_guidelines_prompt() {
            if !system_prompt.is_empty() {
                system_prompt.push_str("\n\n");
            }
            system_prompt.push_str(&guidelines);
        }
        if !self.tag_handlers.is_empty() {
            let tag_parser = StreamingTagParser::new(self.tag_handlers.clone());
            if let Some(instructions) = tag_parser.instructions() {
                if !system_prompt.is_empty() {
                    system_prompt.push_str("\n\n");
                }
                system_prompt.push_str(&instructions);
            }
        }

        let mut response_format = None;
        if let Some(schema) = self.config.output.schema_for_prompt() {
            match self.config.json_capability {
                JsonCapability::JsonSchema => {
                    response_format = Some(StructuredOutputFormat {
                        name: format!("{}_output", self.config.name),
                        description: None,
                        schema: Some(schema),
                        strict: Some(true),
                    });
                }
                JsonCapability::JsonObject => {
                    if !system_prompt.is_empty() {
                        system_prompt.push_str("\n\n");
                    }
                    system_prompt.push_str(&format!(
                        "Respond with a single JSON object matching this schema: {schema}"
                    ));
                }
                JsonCapability::None => {
                    if let Some(last) = messages.last_mut() {
                        last.content.push_str(&format!(
                            "\n\nRespond with JSON matching this schema: {schema}"
                        ));
                    }
                }
            }
        }

        if !system_prompt.is_empty() {
            messages.insert(0, llm_core::Message::system(system_prompt));
        }

        let tool_definitions = self.tools.definitions();
        let mut request = LlmRequest::new(messages).with_params(self.config.params.clone());
        if !tool_definitions.is_empty() {
            request = request.with_tools(tool_definitions).with_tool_choice(ToolChoice::Auto);
        }
        if let Some(format) = response_format {
            request = request.with_response_format(format);
        }
        request
    }

    /// The recursive tool loop (spec §4.9).
    async fn invoke_with_tools(
        &self,
        request: LlmRequest,
        ctx: &PipelineContext,
        iteration: usize,
        loop_detector_key: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, StepFault> {
        if iteration >= self.config.max_tool_iterations {
            return Err(StepFault::Tool(crate::error::ToolError::MaxIterationsExceeded(
                self.config.max_tool_iterations,
            )));
        }

        let step_name = self.config.name.clone();
        let response = if self.config.use_streaming {
            self.invoke_streaming(request.clone(), ctx, &step_name, cancel).await?
        } else {
            self.invoke_once(request.clone(), ctx, &step_name, cancel).await?
        };

        if !response.has_tool_calls() {
            return Ok(response);
        }

        let signature = call_set_signature(&response.tool_calls);
        let mut tracker = ctx
            .metadata_get(loop_detector_key)
            .and_then(|v| serde_json::from_value::<LoopDetectorState>(v).ok())
            .unwrap_or_default();

        if tracker.last_signature.as_ref() == Some(&signature) {
            tracker.consecutive += 1;
        } else {
            tracker.consecutive = 0;
        }
        tracker.last_signature = Some(signature.clone());
        ctx.metadata_set(loop_detector_key, serde_json::to_value(&tracker).unwrap());

        let threshold = if is_read_only_signature(&response.tool_calls) { 3 } else { 1 };
        if tracker.consecutive >= threshold {
            let content = if !response.content.trim().is_empty() {
                response.content.clone()
            } else {
                format!(
                    "Stopped: tool call(s) repeated without progress ({} times in a row).",
                    tracker.consecutive + 1
                )
            };
            ctx.metadata_set(loop_detector_key, Value::Null);
            return Ok(LlmResponse {
                content,
                tool_calls: Vec::new(),
                finish_reason: llm_core::FinishReason::Stop,
                usage: response.usage,
                model: response.model,
                cost_usd: response.cost_usd,
            });
        }

        // Dedup by signature, preserving first occurrence, but still
        // append every original call and its paired response (spec §4.9
        // steps 5-8).
        let mut seen = std::collections::HashSet::new();
        let mut unique_calls: Vec<&ToolCall> = Vec::new();
        for call in &response.tool_calls {
            let sig = canonical_call_signature(call);
            if seen.insert(sig) {
                unique_calls.push(call);
            }
        }

        ctx.conversation
            .write()
            .history
            .add_assistant_message_with_tool_calls(response.tool_calls.clone());

        let mut results_by_signature: HashMap<String, String> = HashMap::new();
        for call in &unique_calls {
            let result = self
                .tools
                .run(&call.id, &call.name, &call.arguments, ctx, &step_name, cancel)
                .await;
            results_by_signature.insert(canonical_call_signature(call), result);
        }

        for call in &response.tool_calls {
            let sig = canonical_call_signature(call);
            let result = results_by_signature.get(&sig).cloned().unwrap_or_default();
            if ctx
                .conversation
                .write()
                .history
                .add_tool_message(call.id.clone(), result)
                .is_err()
            {
                // Dangling id should be unreachable: we just appended the
                // assistant message carrying this exact call above.
            }
        }

        let next_request = self.build_request(ctx);
        Box::pin(self.invoke_with_tools(next_request, ctx, iteration + 1, loop_detector_key, cancel)).await
    }

    async fn invoke_once(
        &self,
        request: LlmRequest,
        ctx: &PipelineContext,
        step_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<LlmResponse, StepFault> {
        let mut response = self
            .provider
            .invoke(request)
            .await
            .map_err(|err| StepFault::Other(err.into()))?;

        if !self.tag_handlers.is_empty() {
            let parser = StreamingTagParser::new(self.tag_handlers.clone());
            response.content = parser.process_complete(&response.content, ctx, step_name, _cancel).await;
        }

        ctx.emit(
            Some(step_name),
            EventKind::LlmResponse {
                finish_reason: response.finish_reason,
                delta: None,
                is_thinking: false,
                usage: response.usage,
                model: response.model.clone(),
            },
        );

        Ok(response)
    }

    async fn invoke_streaming(
        &self,
        request: LlmRequest,
        ctx: &PipelineContext,
        step_name: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, StepFault> {
        use futures::StreamExt;

        let mut stream = self
            .provider
            .invoke_streaming(request)
            .await
            .map_err(|err| StepFault::Other(err.into()))?;

        let mut parser = if self.tag_handlers.is_empty() {
            None
        } else {
            Some(StreamingTagParser::new(self.tag_handlers.clone()))
        };

        let mut content = String::new();
        let mut tool_builders: HashMap<usize, (Option<String>, Option<String>, String)> = HashMap::new();
        let mut usage = None;
        let mut finish_reason = llm_core::FinishReason::Stop;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(StepFault::Other(anyhow::anyhow!("execution cancelled")));
            }
            let chunk = chunk.map_err(|err| StepFault::Other(err.into()))?;

            if let Some(delta) = &chunk.delta {
                let visible = match parser.as_mut() {
                    Some(parser) => parser.feed(delta, ctx, step_name, cancel).await,
                    None => delta.clone(),
                };
                if !chunk.is_thinking {
                    content.push_str(&visible);
                }
                ctx.emit(
                    Some(step_name),
                    EventKind::LlmResponse {
                        finish_reason: llm_core::FinishReason::Streaming,
                        delta: Some(visible),
                        is_thinking: chunk.is_thinking,
                        usage: None,
                        model: None,
                    },
                );
            }

            for (index, update) in &chunk.tool_call_updates {
                let entry = tool_builders.entry(*index).or_insert((None, None, String::new()));
                if let Some(id) = &update.id {
                    entry.0 = Some(id.clone());
                }
                if let Some(name) = &update.name {
                    entry.1 = Some(name.clone());
                }
                entry.2.push_str(&update.arguments_delta);
            }

            if let Some(reason) = chunk.finish_reason {
                finish_reason = reason;
            }
            if chunk.tokens_used.is_some() {
                usage = chunk.tokens_used;
            }
            if chunk.is_complete {
                break;
            }
        }

        ctx.emit(
            Some(step_name),
            EventKind::LlmResponse {
                finish_reason,
                delta: None,
                is_thinking: false,
                usage,
                model: None,
            },
        );

        let tool_calls = tool_builders
            .into_iter()
            .filter_map(|(_, (id, name, arguments))| match (id, name) {
                (Some(id), Some(name)) => Some(ToolCall { id, name, arguments }),
                _ => None,
            })
            .collect();

        Ok(LlmResponse {
            content,
            tool_calls,
            finish_reason,
            usage,
            model: None,
            cost_usd: None,
        })
    }
}

const LOOP_DETECTOR_KEY: &str = "__llm_step_loop_detector";

#[derive(Default, Clone, serde::Serialize, serde::Deserialize)]
struct LoopDetectorState {
    last_signature: Option<String>,
    consecutive: u32,
}

/// Stable textual form of a JSON argument object: keys sorted, whitespace
/// normalized (spec glossary, "Canonical arguments").
fn canonicalize_arguments(arguments_json: &str) -> String {
    match serde_json::from_str::<Value>(arguments_json) {
        Ok(value) => canonical_json_string(&value),
        Err(_) => arguments_json.trim().to_string(),
    }
}

fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json_string(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json_string).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn canonical_call_signature(call: &ToolCall) -> String {
    format!("{}:{}", call.name, canonicalize_arguments(&call.arguments))
}

/// The set of normalized `(name, canonical(arguments))` tuples within one
/// assistant turn (spec glossary, "Call-set signature").
fn call_set_signature(calls: &[ToolCall]) -> String {
    let mut signatures: Vec<String> = calls.iter().map(canonical_call_signature).collect();
    signatures.sort();
    signatures.join("|")
}

fn is_read_only_signature(calls: &[ToolCall]) -> bool {
    calls.iter().all(|call| READ_ONLY_TOOLS.contains(&call.name.as_str()))
}

/// Parses a final response's content per the step's declared output type
/// (spec §4.10).
fn parse_output(spec: &OutputSpec, content: &str) -> Result<Value, ParseError> {
    match spec {
        OutputSpec::Text => Ok(Value::String(content.to_string())),
        OutputSpec::Number => content
            .trim()
            .parse::<f64>()
            .map(|n| serde_json::json!(n))
            .map_err(|_| ParseError::PrimitiveConversion {
                value: content.to_string(),
            }),
        OutputSpec::Boolean => match content.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(ParseError::PrimitiveConversion {
                value: content.to_string(),
            }),
        },
        OutputSpec::Json(_schema) => {
            let cleaned = extract_json_candidate(content)?;
            serde_json::from_str(&cleaned).map_err(|err| ParseError::Deserialize(err.to_string()))
        }
    }
}

/// Strips markdown fences, extracts the first balanced JSON object/array,
/// and tolerates trailing commas (spec §4.10).
fn extract_json_candidate(content: &str) -> Result<String, ParseError> {
    let stripped = strip_markdown_fences(content);
    let candidate = first_balanced_json(&stripped).ok_or_else(|| ParseError::NoJsonFound {
        excerpt: excerpt(&stripped),
    })?;
    Ok(strip_trailing_commas(&candidate))
}

fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

fn first_balanced_json(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find(['{', '['])?;
    let opener = bytes[start] as char;
    let closer = if opener == '{' { '}' } else { ']' };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == opener => depth += 1,
            c if c == closer => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_trailing_commas(json: &str) -> String {
    let mut output = String::with_capacity(json.len());
    let mut chars = json.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if in_string {
            output.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
            output.push(ch);
            continue;
        }
        if ch == ',' {
            let mut lookahead = chars.clone();
            let mut found_closer = false;
            while let Some(next) = lookahead.peek() {
                if next.is_whitespace() {
                    lookahead.next();
                    continue;
                }
                found_closer = matches!(next, '}' | ']');
                break;
            }
            if found_closer {
                continue;
            }
        }
        output.push(ch);
    }
    output
}

fn excerpt(text: &str) -> String {
    if text.len() <= 80 {
        text.to_string()
    } else {
        format!("{}...", &text[..80])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationContext;
    use async_trait::async_trait as local_async_trait;
    use llm_core::{ChunkStream, LLMError};

    struct StaticProvider {
        responses: parking_lot::Mutex<Vec<LlmResponse>>,
    }

    impl StaticProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            StaticProvider {
                responses: parking_lot::Mutex::new(responses),
            }
        }
    }

    #[local_async_trait]
    impl LlmProvider for StaticProvider {
        async fn invoke(&self, _request: LlmRequest) -> Result<LlmResponse, LLMError> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(LLMError::ProviderError("no more scripted responses".into()));
            }
            Ok(responses.remove(0))
        }

        async fn invoke_streaming(&self, _request: LlmRequest) -> Result<ChunkStream, LLMError> {
            Err(LLMError::NotImplemented("streaming not used in this test".into()))
        }

        fn estimate_token_count(&self, text: &str) -> u32 {
            (text.len() as u32).div_ceil(4)
        }
    }

    fn make_context() -> PipelineContext {
        PipelineContext::new(ConversationContext::new("conv-1", 10_000))
    }

    fn basic_config() -> LlmStepConfig {
        LlmStepConfig {
            name: "respond".to_string(),
            max_retries: 1,
            max_tool_iterations: 5,
            use_streaming: false,
            json_capability: JsonCapability::None,
            output: OutputSpec::Text,
            system_prompt: None,
            params: LLMParams::new(),
            message_builder: Arc::new(|input, _ctx| {
                input.as_str().unwrap_or("hello").to_string()
            }),
            timeout: std::time::Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn scenario_a_single_round_trip_no_tools() {
        let provider = Arc::new(StaticProvider::new(vec![LlmResponse {
            content: "Hi!".to_string(),
            tool_calls: vec![],
            finish_reason: llm_core::FinishReason::Stop,
            usage: None,
            model: None,
            cost_usd: None,
        }]));
        let step = LlmStep::new(basic_config(), provider, ToolRegistry::new(), vec![]);
        let ctx = make_context();
        let cancel = CancellationToken::new();
        let result = step.run(&serde_json::json!("Hello"), &ctx, &cancel).await;

        assert_eq!(result.value(), Some(&Value::String("Hi!".to_string())));
        let messages = ctx.conversation.read().history.messages().to_vec();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].content, "Hi!");
    }

    #[tokio::test]
    async fn scenario_d_structural_validation_retry() {
        let provider = Arc::new(StaticProvider::new(vec![
            LlmResponse {
                content: "not json at all".to_string(),
                tool_calls: vec![],
                finish_reason: llm_core::FinishReason::Stop,
                usage: None,
                model: None,
                cost_usd: None,
            },
            LlmResponse {
                content: r#"{"name":"a","age":7}"#.to_string(),
                tool_calls: vec![],
                finish_reason: llm_core::FinishReason::Stop,
                usage: None,
                model: None,
                cost_usd: None,
            },
        ]));
        let mut config = basic_config();
        config.max_retries = 2;
        config.output = OutputSpec::Json(schemars::json_schema!({
            "type": "object",
            "properties": { "name": { "type": "string" }, "age": { "type": "integer" } }
        }));
        let step = LlmStep::new(config, provider, ToolRegistry::new(), vec![]);
        let ctx = make_context();
        let cancel = CancellationToken::new();
        let result = step.run(&serde_json::json!("give me a record"), &ctx, &cancel).await;

        assert_eq!(result.value().unwrap()["name"], "a");
        assert_eq!(result.value().unwrap()["age"], 7);
        let messages = ctx.conversation.read().history.messages().to_vec();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn scenario_b_one_tool_call() {
        let provider = Arc::new(StaticProvider::new(vec![
            LlmResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c1".to_string(),
                    name: "now".to_string(),
                    arguments: r#"{"tz":"UTC"}"#.to_string(),
                }],
                finish_reason: llm_core::FinishReason::ToolCalls,
                usage: None,
                model: None,
                cost_usd: None,
            },
            LlmResponse {
                content: "It is 2025-01-01T00:00:00Z.".to_string(),
                tool_calls: vec![],
                finish_reason: llm_core::FinishReason::Stop,
                usage: None,
                model: None,
                cost_usd: None,
            },
        ]));

        struct NowTool;
        #[local_async_trait]
        impl crate::tool::Tool for NowTool {
            fn name(&self) -> &str {
                "now"
            }
            fn description(&self) -> &str {
                "Returns the current time"
            }
            fn parameters_schema(&self) -> Schema {
                schemars::json_schema!({ "type": "object" })
            }
            async fn execute(
                &self,
                _arguments_json: &str,
                _ctx: &PipelineContext,
                _step_name: &str,
                _cancel: &CancellationToken,
            ) -> anyhow::Result<String> {
                Ok("2025-01-01T00:00:00Z".to_string())
            }
        }

        let step = LlmStep::new(
            basic_config(),
            provider,
            ToolRegistry::new().with_tool(Arc::new(NowTool)),
            vec![],
        );
        let ctx = make_context();
        let cancel = CancellationToken::new();
        let result = step
            .run(&serde_json::json!("What time is it in UTC?"), &ctx, &cancel)
            .await;

        assert_eq!(
            result.value(),
            Some(&Value::String("It is 2025-01-01T00:00:00Z.".to_string()))
        );
        let messages = ctx.conversation.read().history.messages().to_vec();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn scenario_c_loop_on_write_tool_terminates_deterministically() {
        let provider = Arc::new(StaticProvider::new(vec![
            LlmResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c1".to_string(),
                    name: "write_file".to_string(),
                    arguments: r#"{"path":"a.txt","contents":"X"}"#.to_string(),
                }],
                finish_reason: llm_core::FinishReason::ToolCalls,
                usage: None,
                model: None,
                cost_usd: None,
            },
            LlmResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c2".to_string(),
                    name: "write_file".to_string(),
                    arguments: r#"{"path":"a.txt","contents":"X"}"#.to_string(),
                }],
                finish_reason: llm_core::FinishReason::ToolCalls,
                usage: None,
                model: None,
                cost_usd: None,
            },
        ]));

        struct WriteTool;
        #[local_async_trait]
        impl crate::tool::Tool for WriteTool {
            fn name(&self) -> &str {
                "write_file"
            }
            fn description(&self) -> &str {
                "Writes a file"
            }
            fn parameters_schema(&self) -> Schema {
                schemars::json_schema!({ "type": "object" })
            }
            async fn execute(
                &self,
                _arguments_json: &str,
                _ctx: &PipelineContext,
                _step_name: &str,
                _cancel: &CancellationToken,
            ) -> anyhow::Result<String> {
                Ok("written".to_string())
            }
        }

        let step = LlmStep::new(
            basic_config(),
            provider,
            ToolRegistry::new().with_tool(Arc::new(WriteTool)),
            vec![],
        );
        let ctx = make_context();
        let cancel = CancellationToken::new();
        let result = step.run(&serde_json::json!("write it twice"), &ctx, &cancel).await;

        // Only two scripted provider responses exist; the loop detector must
        // stop before a third call would be attempted.
        assert!(result.value().is_some());
    }

    #[test]
    fn canonicalize_arguments_sorts_keys() {
        let a = canonicalize_arguments(r#"{"b":1,"a":2}"#);
        let b = canonicalize_arguments(r#"{"a": 2, "b": 1}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn extract_json_candidate_strips_markdown_fences() {
        let text = "```json\n{\"a\":1}\n```";
        let cleaned = extract_json_candidate(text).unwrap();
        assert_eq!(cleaned, r#"{"a":1}"#);
    }

    #[test]
    fn extract_json_candidate_tolerates_trailing_commas() {
        let text = r#"{"a":1,"b":2,}"#;
        let cleaned = extract_json_candidate(text).unwrap();
        let parsed: Value = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"], 2);
    }

    #[test]
    fn parse_output_number_converts_text() {
        let value = parse_output(&OutputSpec::Number, "42").unwrap();
        assert_eq!(value, serde_json::json!(42.0));
    }

    #[test]
    fn parse_output_number_fails_on_garbage() {
        assert!(parse_output(&OutputSpec::Number, "not-a-number").is_err());
    }
}
