//! Structured error types for the pipeline engine.
//!
//! `StepFault` is the catch-all a step's `execute`/`validate`/`finalize` may
//! return; the executor converts it into a `StepResult::Error` at the step
//! boundary (spec §4.1 — downstream code never sees a raw exception).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step '{step}' timed out after {elapsed_ms}ms")]
    Timeout { step: String, elapsed_ms: u64 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("step '{step}' exceeded max_retries ({max_retries})")]
    RetriesExhausted { step: String, max_retries: u32 },

    #[error("step '{step}' panicked: {message}")]
    Panicked { step: String, message: String },

    #[error(transparent)]
    Step(#[from] StepFault),
}

/// What a step's own logic can go wrong with. Distinct from `PipelineError`,
/// which is what the executor itself detects (timeouts, cancellation,
/// retry exhaustion) around a step's invocation.
#[derive(Debug, Error)]
pub enum StepFault {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("response parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Parsing a model response into the step's declared output type.
#[derive(Debug, Error, Clone)]
pub enum ParseError {
    #[error("expected a JSON object or array, found none in: {excerpt}")]
    NoJsonFound { excerpt: String },

    #[error("could not convert \"{value}\" to the declared primitive type")]
    PrimitiveConversion { value: String },

    #[error("failed to deserialize response into the declared type: {0}")]
    Deserialize(String),
}

#[derive(Debug, Error, Clone)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("Error executing tool: {0}")]
    Execution(String),

    #[error("max_tool_iterations ({0}) exceeded")]
    MaxIterationsExceeded(usize),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
